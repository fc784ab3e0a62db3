use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DeviceSnapshot, SessionAction, SessionEvent, SessionHandle};
use crate::api::{ApiError, BrokerCredentials, Device, DeviceBackend, DeviceDetail, DeviceId};
use crate::devices::{AgentState, CommandError, DeviceAgent, HandlerDispatch, TypeCatalog};
use crate::mqtt::{
    BrokerConnector, BrokerEvent, BrokerSettings, ConnectOutcome, ConnectionManager,
    ConnectionState,
};

const ACTION_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 256;

/// Result of a REST call, fed back into the loop.
enum Fetched {
    Broker(Result<BrokerCredentials, ApiError>),
    Types(Result<TypeCatalog, ApiError>),
    Devices(Result<Vec<Device>, ApiError>),
    // device id, fetch generation
    Detail(DeviceId, u64, Result<DeviceDetail, ApiError>),
}

/// One unit of work for the loop.
enum Step {
    Action(SessionAction),
    Broker(BrokerEvent),
    Fetched(Fetched),
    State(ConnectionState),
    Stop,
}

/// Owner of the connection, the dispatch and all device agents.
pub struct SyncSession {
    backend: Arc<dyn DeviceBackend>,
    connection: ConnectionManager,
    dispatch: HandlerDispatch,
    agents: BTreeMap<DeviceId, DeviceAgent>,
    catalog: TypeCatalog,
    events: broadcast::Sender<SessionEvent>,
    broker_tx: mpsc::Sender<BrokerEvent>,
    fetched_tx: mpsc::Sender<Fetched>,
    next_generation: u64,
    // stops fetches still in flight at teardown
    cancel: CancellationToken,
}

impl SyncSession {
    /// Starts the loop and the bootstrap fetches.
    pub fn spawn(
        settings: &BrokerSettings,
        backend: Arc<dyn DeviceBackend>,
        connector: Arc<dyn BrokerConnector>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (action_tx, action_rx) = mpsc::channel(ACTION_CAPACITY);
        let (broker_tx, broker_rx) = mpsc::channel(settings.channel_capacity.max(1));
        let (fetched_tx, fetched_rx) = mpsc::channel(ACTION_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let session = SyncSession {
            backend,
            connection: ConnectionManager::new(connector, settings.clone()),
            dispatch: HandlerDispatch::new(),
            agents: BTreeMap::new(),
            catalog: TypeCatalog::default(),
            events: events.clone(),
            broker_tx,
            fetched_tx,
            next_generation: 0,
            cancel: CancellationToken::new(),
        };

        let task = tokio::spawn(session.run(action_rx, broker_rx, fetched_rx));
        (SessionHandle::new(action_tx, events), task)
    }

    async fn run(
        mut self,
        mut actions: mpsc::Receiver<SessionAction>,
        mut broker_rx: mpsc::Receiver<BrokerEvent>,
        mut fetched_rx: mpsc::Receiver<Fetched>,
    ) {
        info!("Sync session started");
        let mut state_rx = self.connection.watch_state();
        self.bootstrap();

        loop {
            let step = tokio::select! {
                action = actions.recv() => match action {
                    Some(action) => Step::Action(action),
                    None => Step::Stop,
                },
                Some(event) = broker_rx.recv() => Step::Broker(event),
                Some(fetched) = fetched_rx.recv() => Step::Fetched(fetched),
                Ok(()) = state_rx.changed() => Step::State(*state_rx.borrow_and_update()),
            };

            match step {
                Step::Action(action) => {
                    if let Some(response_tx) = self.handle_action(action) {
                        self.teardown().await;
                        if response_tx.send(()).is_err() {
                            debug!("Shutdown requester went away");
                        }
                        break;
                    }
                }
                Step::Broker(event) => self.on_broker_event(event),
                Step::Fetched(fetched) => self.on_fetched(fetched).await,
                Step::State(state) => {
                    info!("Broker connection {:?}", state);
                    self.notify(SessionEvent::ConnectionChanged(state));
                }
                Step::Stop => {
                    debug!("All session handles dropped");
                    self.teardown().await;
                    break;
                }
            }
        }
    }

    fn bootstrap(&self) {
        let backend = self.backend.clone();
        self.spawn_fetch(async move { Fetched::Broker(backend.fetch_broker().await) });
        let backend = self.backend.clone();
        self.spawn_fetch(async move { Fetched::Types(backend.fetch_types().await) });
        let backend = self.backend.clone();
        self.spawn_fetch(async move { Fetched::Devices(backend.fetch_devices().await) });
    }

    fn spawn_fetch<F>(&self, fetch: F)
    where
        F: Future<Output = Fetched> + Send + 'static,
    {
        let tx = self.fetched_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                fetched = fetch => {
                    // Session gone means nobody needs the result
                    let _ = tx.send(fetched).await;
                }
            }
        });
    }

    fn notify(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Serves one request. Returns the requester's reply channel on shutdown.
    fn handle_action(&mut self, action: SessionAction) -> Option<oneshot::Sender<()>> {
        match action {
            SessionAction::AddDevice {
                device,
                response_tx,
            } => {
                let _ = response_tx.send(self.add_device(device));
            }
            SessionAction::RemoveDevice {
                device_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.remove_device(&device_id));
            }
            SessionAction::SetInput {
                device_id,
                text,
                response_tx,
            } => {
                let result = match self.agents.get_mut(&device_id) {
                    Some(agent) => {
                        agent.set_input(text);
                        Ok(())
                    }
                    None => Err(CommandError::UnknownDevice(device_id)),
                };
                let _ = response_tx.send(result);
            }
            SessionAction::PublishCommand {
                device_id,
                topic,
                message,
                retain,
                response_tx,
            } => {
                let result = match self.agents.get_mut(&device_id) {
                    Some(agent) => agent.publish_command(
                        &self.connection,
                        &topic,
                        message.as_deref(),
                        retain,
                    ),
                    None => Err(CommandError::UnknownDevice(device_id)),
                };
                if let Err(e) = &result {
                    warn!("Command for {} rejected: {}", topic, e);
                }
                let _ = response_tx.send(result);
            }
            SessionAction::Snapshot { response_tx } => {
                let snapshot: Vec<DeviceSnapshot> = self
                    .agents
                    .values()
                    .map(|agent| agent.snapshot(&self.catalog))
                    .collect();
                let _ = response_tx.send(snapshot);
            }
            SessionAction::ConnectionState { response_tx } => {
                let _ = response_tx.send(self.connection.state());
            }
            SessionAction::Shutdown { response_tx } => return Some(response_tx),
        }
        None
    }

    /// Registers the handler first, then starts the detail fetch.
    fn add_device(&mut self, device: Device) -> bool {
        if self.agents.contains_key(&device.id) {
            debug!("Device {} already known", device.id);
            return false;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let agent = DeviceAgent::new(device).with_generation(generation);
        let id = agent.id().clone();
        self.dispatch
            .register(id.clone(), agent.handler(self.events.clone()));
        self.agents.insert(id.clone(), agent);
        self.notify(SessionEvent::DeviceAdded(id.clone()));

        let backend = self.backend.clone();
        self.spawn_fetch(async move {
            let result = backend.fetch_device_detail(&id).await;
            Fetched::Detail(id, generation, result)
        });
        true
    }

    fn remove_device(&mut self, device_id: &DeviceId) -> bool {
        if self.agents.remove(device_id).is_none() {
            return false;
        }
        for topic in self.dispatch.unregister(device_id) {
            self.connection.unsubscribe(&topic);
        }
        info!("Device {} removed", device_id);
        self.notify(SessionEvent::DeviceRemoved(device_id.clone()));
        true
    }

    async fn on_fetched(&mut self, fetched: Fetched) {
        match fetched {
            Fetched::Broker(Ok(credentials)) => {
                let server = credentials.server.clone();
                match self
                    .connection
                    .connect(credentials, self.broker_tx.clone())
                    .await
                {
                    Ok(ConnectOutcome::AlreadyConnected) => {
                        debug!("Already connected to {}", server)
                    }
                    Ok(outcome) => info!("Broker link to {} {:?}", server, outcome),
                    Err(e) => error!("Could not connect to {}: {}", server, e),
                }
            }
            Fetched::Broker(Err(e)) => error!("Could not fetch broker credentials: {}", e),
            Fetched::Types(Ok(catalog)) => {
                info!(
                    "Type catalog loaded: {} device types, {} sensor types",
                    catalog.device.len(),
                    catalog.sensor.len()
                );
                self.catalog = catalog;
                for agent in self.agents.values() {
                    agent.refresh_capabilities(&self.catalog);
                }
            }
            Fetched::Types(Err(e)) => warn!("Type catalog unavailable, using built-ins: {}", e),
            Fetched::Devices(Ok(devices)) => {
                info!("Device list loaded: {} devices", devices.len());
                for device in devices {
                    self.add_device(device);
                }
            }
            Fetched::Devices(Err(e)) => error!("Could not fetch device list: {}", e),
            Fetched::Detail(device_id, generation, result) => {
                self.on_detail(device_id, generation, result)
            }
        }
    }

    fn on_detail(
        &mut self,
        device_id: DeviceId,
        generation: u64,
        result: Result<DeviceDetail, ApiError>,
    ) {
        let Some(agent) = self.agents.get_mut(&device_id) else {
            debug!("Detail for removed device {} ignored", device_id);
            return;
        };
        // a removed and re-added device gets a new generation
        if agent.generation() != generation || agent.state() != AgentState::Registered {
            debug!("Stale detail for device {} ignored", device_id);
            return;
        }

        let loaded = result
            .map_err(|e| e.to_string())
            .and_then(|detail| agent.load(&detail, &self.catalog).map_err(|e| e.to_string()));

        match loaded {
            Ok(topics) => {
                for topic in &topics {
                    self.dispatch.route(&device_id, topic);
                    self.connection.subscribe(topic);
                }
                self.notify(SessionEvent::DeviceLoaded { device_id, topics });
            }
            Err(reason) => {
                error!("Could not load device {}: {}", device_id, reason);
                agent.mark_failed();
                self.notify(SessionEvent::DeviceFailed { device_id, reason });
            }
        }
    }

    fn on_broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                let count = self.connection.resubscribe_all();
                debug!("Resubscribed {} topics", count);
            }
            BrokerEvent::Disconnected => debug!("Broker link dropped"),
            BrokerEvent::Message(message) => {
                let report = self.dispatch.dispatch(&message.topic, &message.payload);
                if report.routed == 0 {
                    debug!("Message on unrouted topic {} ignored", message.topic);
                }
            }
        }
    }

    async fn teardown(&mut self) {
        info!("Stopping sync session");
        self.cancel.cancel();
        self.dispatch.clear();
        self.agents.clear();
        self.connection.close().await;
        info!("Sync session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{BrokerMessage, PublishOutcome};
    use crate::testing::{credentials, next_event, wait_until, FakeBackend, FakeConnector, TransportCall};
    use std::time::Duration;

    fn spawn(backend: FakeBackend) -> (SessionHandle, JoinHandle<()>, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::default());
        let (handle, task) =
            SyncSession::spawn(&BrokerSettings::default(), Arc::new(backend), connector.clone());
        (handle, task, connector)
    }

    fn dashboard() -> FakeBackend {
        FakeBackend::default()
            .with_broker(credentials("broker.test"))
            .with_device(1, 0, &[("home/1/temp", 0)])
            .with_device(2, 17, &[("home/2/power", 17)])
    }

    async fn wait_loaded(events: &mut broadcast::Receiver<SessionEvent>, count: usize) {
        for _ in 0..count {
            next_event(events, |event| matches!(event, SessionEvent::DeviceLoaded { .. })).await;
        }
    }

    #[tokio::test]
    async fn value_reaches_only_the_owning_device() {
        let (handle, _task, connector) = spawn(dashboard());
        let mut events = handle.events();
        wait_loaded(&mut events, 2).await;
        wait_until(|| connector.open_count() == 1).await;

        let link = connector.link(0);
        link.set_state(ConnectionState::Connected);
        link.events.send(BrokerEvent::Connected).await.unwrap();
        link.events
            .send(BrokerEvent::Message(BrokerMessage::from_topic("home/1/temp", "23.5")))
            .await
            .unwrap();

        let update = match next_event(&mut events, |event| {
            matches!(event, SessionEvent::ValueChanged(_))
        })
        .await
        {
            SessionEvent::ValueChanged(update) => update,
            _ => unreachable!(),
        };
        assert_eq!(update.device_id, DeviceId::from(1));
        assert_eq!(update.display, "23.5 °C");

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[0].topic("home/1/temp").unwrap().value, "23.5");
        assert_eq!(snapshot[1].topic("home/2/power").unwrap().value, "");
        assert_eq!(
            link.transport.calls(),
            vec![
                TransportCall::Subscribe("home/1/temp".into()),
                TransportCall::Subscribe("home/2/power".into()),
            ]
        );
    }

    #[tokio::test]
    async fn command_is_published_once_and_input_cleared() {
        let (handle, _task, connector) = spawn(dashboard());
        let mut events = handle.events();
        wait_loaded(&mut events, 2).await;
        wait_until(|| connector.open_count() == 1).await;
        connector.link(0).set_state(ConnectionState::Connected);

        handle.set_input(DeviceId::from(2), "50").await.unwrap();
        let outcome = handle
            .publish_command(DeviceId::from(2), "home/2/power", None, true)
            .await
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Sent);
        let publishes: Vec<_> = connector
            .link(0)
            .transport
            .calls()
            .into_iter()
            .filter(|call| matches!(call, TransportCall::Publish { .. }))
            .collect();
        assert_eq!(
            publishes,
            vec![TransportCall::Publish {
                topic: "home/2/power".into(),
                payload: "50".into(),
                retain: true,
            }]
        );
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[1].pending_input, "");
    }

    #[tokio::test]
    async fn command_without_broker_is_dropped() {
        let backend = FakeBackend::default().with_device(2, 17, &[("home/2/power", 17)]);
        let (handle, _task, connector) = spawn(backend);
        let mut events = handle.events();
        wait_loaded(&mut events, 1).await;

        handle.set_input(DeviceId::from(2), "50").await.unwrap();
        let outcome = handle
            .publish_command(DeviceId::from(2), "home/2/power", None, false)
            .await
            .unwrap();

        assert_eq!(outcome, PublishOutcome::Dropped);
        assert_eq!(connector.open_count(), 0);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[0].pending_input, "50");
        assert_eq!(
            handle.connection_state().await.unwrap(),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn invalid_commands_are_rejected() {
        let (handle, _task, _connector) = spawn(dashboard());
        let mut events = handle.events();
        wait_loaded(&mut events, 2).await;

        let unknown = handle
            .publish_command(DeviceId::from(9), "home/9/power", Some("1".into()), false)
            .await;
        assert!(matches!(unknown, Err(CommandError::UnknownDevice(_))));

        let read_only = handle
            .publish_command(DeviceId::from(1), "home/1/temp", Some("1".into()), false)
            .await;
        assert!(matches!(read_only, Err(CommandError::NotWritable(_))));

        let empty = handle
            .publish_command(DeviceId::from(2), "home/2/power", None, false)
            .await;
        assert!(matches!(empty, Err(CommandError::EmptyMessage)));
    }

    #[tokio::test]
    async fn failed_detail_marks_device_failed() {
        let backend = FakeBackend::default().with_device_without_detail(5, 0);
        let (handle, _task, _connector) = spawn(backend);
        let mut events = handle.events();

        let failed = next_event(&mut events, |event| {
            matches!(event, SessionEvent::DeviceFailed { .. })
        })
        .await;
        assert!(matches!(
            failed,
            SessionEvent::DeviceFailed { device_id, .. } if device_id == DeviceId::from(5)
        ));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[0].state, crate::devices::AgentState::Failed);
        assert!(snapshot[0].topics.is_empty());
    }

    #[tokio::test]
    async fn removed_device_stops_receiving_values() {
        let (handle, _task, connector) = spawn(dashboard());
        let mut events = handle.events();
        wait_loaded(&mut events, 2).await;
        wait_until(|| connector.open_count() == 1).await;
        let link = connector.link(0);
        link.set_state(ConnectionState::Connected);

        assert!(handle.remove_device(DeviceId::from(1)).await.unwrap());
        assert!(!handle.remove_device(DeviceId::from(1)).await.unwrap());
        assert!(link
            .transport
            .calls()
            .contains(&TransportCall::Unsubscribe("home/1/temp".into())));

        link.events
            .send(BrokerEvent::Message(BrokerMessage::from_topic("home/1/temp", "21")))
            .await
            .unwrap();
        link.events
            .send(BrokerEvent::Message(BrokerMessage::from_topic("home/2/power", "3")))
            .await
            .unwrap();

        let update = next_event(&mut events, |event| {
            matches!(event, SessionEvent::ValueChanged(_))
        })
        .await;
        assert!(matches!(
            update,
            SessionEvent::ValueChanged(update) if update.device_id == DeviceId::from(2)
        ));
        assert_eq!(handle.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn late_detail_of_removed_device_keeps_values() {
        let backend = FakeBackend::default()
            .with_broker(credentials("broker.test"))
            .with_device(1, 0, &[("home/1/temp", 0)])
            .with_detail_delays(&[400, 50]);
        let (handle, _task, connector) = spawn(backend);
        let mut events = handle.events();
        next_event(&mut events, |event| {
            *event == SessionEvent::DeviceAdded(DeviceId::from(1))
        })
        .await;

        // first detail request is still in flight
        assert!(handle.remove_device(DeviceId::from(1)).await.unwrap());
        let device = Device {
            id: DeviceId::from(1),
            device_type: 0,
            room: None,
            name: "device-1".into(),
        };
        assert!(handle.add_device(device).await.unwrap());
        wait_loaded(&mut events, 1).await;

        wait_until(|| connector.open_count() == 1).await;
        let link = connector.link(0);
        link.set_state(ConnectionState::Connected);
        link.events.send(BrokerEvent::Connected).await.unwrap();
        link.events
            .send(BrokerEvent::Message(BrokerMessage::from_topic("home/1/temp", "23.5")))
            .await
            .unwrap();
        next_event(&mut events, |event| matches!(event, SessionEvent::ValueChanged(_))).await;

        tokio::time::sleep(Duration::from_millis(500)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[0].state, AgentState::Loaded);
        assert_eq!(snapshot[0].topic("home/1/temp").unwrap().value, "23.5");
        assert_eq!(
            link.transport.calls(),
            vec![TransportCall::Subscribe("home/1/temp".into())]
        );
    }

    #[tokio::test]
    async fn duplicate_device_is_ignored() {
        let (handle, _task, _connector) = spawn(dashboard());
        let mut events = handle.events();
        wait_loaded(&mut events, 2).await;

        let device = Device {
            id: DeviceId::from(1),
            device_type: 0,
            room: None,
            name: "again".into(),
        };
        assert!(!handle.add_device(device).await.unwrap());
        assert_eq!(handle.snapshot().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn connection_changes_are_broadcast() {
        let (handle, _task, connector) = spawn(dashboard());
        let mut events = handle.events();
        wait_until(|| connector.open_count() == 1).await;

        connector.link(0).set_state(ConnectionState::Connected);

        next_event(&mut events, |event| {
            *event == SessionEvent::ConnectionChanged(ConnectionState::Connected)
        })
        .await;
        assert_eq!(
            handle.connection_state().await.unwrap(),
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn shutdown_closes_connection_and_ends_loop() {
        let (handle, task, connector) = spawn(dashboard());
        let mut events = handle.events();
        wait_loaded(&mut events, 2).await;
        wait_until(|| connector.open_count() == 1).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(connector.link(0).cancel.is_cancelled());
        assert!(connector
            .link(0)
            .transport
            .calls()
            .contains(&TransportCall::Disconnect));
        assert!(matches!(
            handle.snapshot().await,
            Err(crate::session::SessionError::Closed)
        ));
    }
}
