use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ClientError, QoS};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BrokerSettings, MqttConfig};
use super::link::{self, BrokerLink};
use super::message::BrokerEvent;
use crate::api::BrokerCredentials;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

impl ConnectionState {
    /// Whether a link in this state is still trying to serve the session.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("MQTT client request failed: {0}")]
    Client(#[from] ClientError),

    #[error("Broker transport error: {0}")]
    Transport(String),

    #[error("Failed to open broker link: {0}")]
    Open(String),
}

/// What happened to a publish request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport.
    Sent,
    /// Not connected; nothing was sent.
    Dropped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Opened,
    /// A live link with the same credentials already exists.
    AlreadyConnected,
    /// The previous link was closed in favour of new credentials.
    Replaced,
}

/// Request side of an open broker link.
///
/// Calls only enqueue; they never wait on the network.
pub trait BrokerTransport: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), ConnectionError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError>;
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), ConnectionError>;
    fn disconnect(&self) -> Result<(), ConnectionError>;
}

impl BrokerTransport for AsyncClient {
    fn subscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        Ok(self.try_subscribe(topic, QoS::AtMostOnce)?)
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        Ok(self.try_unsubscribe(topic)?)
    }

    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), ConnectionError> {
        Ok(self.try_publish(topic, QoS::AtMostOnce, retain, payload.as_bytes().to_vec())?)
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        Ok(self.try_disconnect()?)
    }
}

/// A running link: its request side and the task driving it.
pub struct LinkHandle {
    pub transport: Arc<dyn BrokerTransport>,
    pub task: JoinHandle<()>,
}

/// Opens broker links.
///
/// The link task reports inbound traffic on `events` and its lifecycle on
/// `state`, and must end once `cancel` fires.
pub trait BrokerConnector: Send + Sync {
    fn open(
        &self,
        config: MqttConfig,
        events: mpsc::Sender<BrokerEvent>,
        state: Arc<watch::Sender<ConnectionState>>,
        cancel: CancellationToken,
    ) -> Result<LinkHandle, ConnectionError>;
}

/// Connector backed by rumqttc over secure websockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttConnector;

impl BrokerConnector for RumqttConnector {
    fn open(
        &self,
        config: MqttConfig,
        events: mpsc::Sender<BrokerEvent>,
        state: Arc<watch::Sender<ConnectionState>>,
        cancel: CancellationToken,
    ) -> Result<LinkHandle, ConnectionError> {
        info!("Opening broker link to {} as {}", config.broker_url, config.client_id);
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), config.channel_capacity);
        let link = BrokerLink::create(
            eventloop,
            events,
            state,
            config.reconnect.clone(),
            cancel,
            config.broker_url.clone(),
        );
        let task = tokio::spawn(link::drive(link));
        Ok(LinkHandle {
            transport: Arc::new(client),
            task,
        })
    }
}

struct ActiveLink {
    credentials: BrokerCredentials,
    transport: Arc<dyn BrokerTransport>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the single broker connection of a session.
///
/// Subscriptions are remembered here so they survive reconnects and
/// credential changes; call [`ConnectionManager::resubscribe_all`] on every
/// [`BrokerEvent::Connected`].
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    settings: BrokerSettings,
    state: Arc<watch::Sender<ConnectionState>>,
    active: Option<ActiveLink>,
    subscriptions: BTreeSet<String>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, settings: BrokerSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            settings,
            state: Arc::new(state),
            active: None,
            subscriptions: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change of every link.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn credentials(&self) -> Option<&BrokerCredentials> {
        self.active.as_ref().map(|active| &active.credentials)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    /// Opens a link with `credentials`, forwarding inbound events to `events`.
    ///
    /// A live link with equal credentials is kept. Different credentials
    /// close the current link first, so at most one link exists at a time.
    pub async fn connect(
        &mut self,
        credentials: BrokerCredentials,
        events: mpsc::Sender<BrokerEvent>,
    ) -> Result<ConnectOutcome, ConnectionError> {
        let mut outcome = ConnectOutcome::Opened;
        if let Some(active) = &self.active {
            if active.credentials == credentials
                && self.state().is_live()
                && !active.task.is_finished()
            {
                debug!("Broker link to {} already live", credentials.server);
                return Ok(ConnectOutcome::AlreadyConnected);
            }
            if active.credentials != credentials {
                info!(
                    "Broker credentials changed, replacing link to {}",
                    active.credentials.server
                );
                outcome = ConnectOutcome::Replaced;
            }
            self.close().await;
        }

        let config = MqttConfig::from_credentials(&credentials, &self.settings);
        let cancel = CancellationToken::new();
        self.state.send_replace(ConnectionState::Connecting);
        let handle = match self
            .connector
            .open(config, events, self.state.clone(), cancel.clone())
        {
            Ok(handle) => handle,
            Err(e) => {
                error!("Could not open broker link to {}: {}", credentials.server, e);
                self.state.send_replace(ConnectionState::Failed);
                return Err(e);
            }
        };

        self.active = Some(ActiveLink {
            credentials,
            transport: handle.transport,
            cancel,
            task: handle.task,
        });
        Ok(outcome)
    }

    /// Remembers `topic` and subscribes right away when connected.
    ///
    /// Returns whether the topic was new. Transport errors are logged; the
    /// topic stays desired and is retried on the next ConnAck.
    pub fn subscribe(&mut self, topic: &str) -> bool {
        let added = self.subscriptions.insert(topic.to_string());
        if added {
            match self.connected_transport() {
                Some(transport) => match transport.subscribe(topic) {
                    Ok(()) => info!("Subscribed to {}", topic),
                    Err(e) => warn!("Subscribe to {} failed: {}", topic, e),
                },
                None => debug!("Subscription to {} deferred until connected", topic),
            }
        }
        added
    }

    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        let removed = self.subscriptions.remove(topic);
        if removed {
            if let Some(transport) = self.connected_transport() {
                match transport.unsubscribe(topic) {
                    Ok(()) => info!("Unsubscribed from {}", topic),
                    Err(e) => warn!("Unsubscribe from {} failed: {}", topic, e),
                }
            }
        }
        removed
    }

    /// Issues every remembered subscription on the current link.
    ///
    /// Returns how many requests were accepted by the transport.
    pub fn resubscribe_all(&self) -> usize {
        let Some(transport) = self.connected_transport() else {
            return 0;
        };
        let mut issued = 0;
        for topic in &self.subscriptions {
            match transport.subscribe(topic) {
                Ok(()) => issued += 1,
                Err(e) => warn!("Subscribe to {} failed: {}", topic, e),
            }
        }
        if issued > 0 {
            info!("Subscribed to {} topics", issued);
        }
        issued
    }

    /// Publishes with QoS 0. Not being connected is not an error.
    pub fn publish(
        &self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<PublishOutcome, ConnectionError> {
        match self.connected_transport() {
            Some(transport) => {
                transport.publish(topic, payload, retain)?;
                Ok(PublishOutcome::Sent)
            }
            None => Ok(PublishOutcome::Dropped),
        }
    }

    /// Disconnects and waits for the link task to end.
    pub async fn close(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        if let Err(e) = active.transport.disconnect() {
            debug!("Disconnect request not delivered: {}", e);
        }
        active.cancel.cancel();

        let abort = active.task.abort_handle();
        match tokio::time::timeout(CLOSE_TIMEOUT, active.task).await {
            Ok(Ok(())) => debug!("Broker link to {} closed", active.credentials.server),
            Ok(Err(e)) => warn!("Broker link task ended abnormally: {}", e),
            Err(_) => {
                warn!("Broker link did not stop in time, aborting");
                abort.abort();
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn connected_transport(&self) -> Option<&Arc<dyn BrokerTransport>> {
        if !self.is_connected() {
            return None;
        }
        self.active.as_ref().map(|active| &active.transport)
    }
}
