//! In-memory doubles for the broker and the REST backend.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, BrokerCredentials, Device, DeviceBackend, DeviceDetail, DeviceId, SensorTopic};
use crate::devices::TypeCatalog;
use crate::mqtt::{
    BrokerConnector, BrokerEvent, BrokerTransport, ConnectionError, ConnectionState, MqttConfig,
};
use crate::mqtt::connection::LinkHandle;
use crate::session::SessionEvent;

const WAIT_LIMIT: Duration = Duration::from_secs(2);

pub fn credentials(server: &str) -> BrokerCredentials {
    BrokerCredentials {
        server: server.to_string(),
        websocket_port: 8443,
        user: "dash".to_string(),
        password: "secret".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Subscribe(String),
    Unsubscribe(String),
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
    Disconnect,
}

#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
}

impl RecordingTransport {
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: TransportCall) -> Result<(), ConnectionError> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl BrokerTransport for RecordingTransport {
    fn subscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        self.record(TransportCall::Subscribe(topic.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        self.record(TransportCall::Unsubscribe(topic.to_string()))
    }

    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), ConnectionError> {
        self.record(TransportCall::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        })
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        self.record(TransportCall::Disconnect)
    }
}

/// One link opened through [`FakeConnector`]; the test plays the broker.
pub struct FakeLink {
    pub config: MqttConfig,
    pub transport: Arc<RecordingTransport>,
    pub events: mpsc::Sender<BrokerEvent>,
    pub state: Arc<watch::Sender<ConnectionState>>,
    pub cancel: CancellationToken,
}

impl FakeLink {
    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

#[derive(Default)]
pub struct FakeConnector {
    links: Mutex<Vec<Arc<FakeLink>>>,
    refuse: bool,
}

impl FakeConnector {
    /// Connector whose every open fails.
    pub fn failing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn link(&self, index: usize) -> Arc<FakeLink> {
        self.links.lock().unwrap()[index].clone()
    }

    pub fn open_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

impl BrokerConnector for FakeConnector {
    fn open(
        &self,
        config: MqttConfig,
        events: mpsc::Sender<BrokerEvent>,
        state: Arc<watch::Sender<ConnectionState>>,
        cancel: CancellationToken,
    ) -> Result<LinkHandle, ConnectionError> {
        if self.refuse {
            return Err(ConnectionError::Open("refused by test".to_string()));
        }

        let transport = Arc::new(RecordingTransport::default());
        let stop = cancel.clone();
        let task = tokio::spawn(async move { stop.cancelled().await });
        self.links.lock().unwrap().push(Arc::new(FakeLink {
            config,
            transport: transport.clone(),
            events,
            state,
            cancel,
        }));

        Ok(LinkHandle { transport, task })
    }
}

#[derive(Default, Clone)]
pub struct FakeBackend {
    broker: Option<BrokerCredentials>,
    devices: Vec<Device>,
    details: HashMap<DeviceId, DeviceDetail>,
    types: TypeCatalog,
    // consumed one per detail request, in request order
    detail_delays: Arc<Mutex<VecDeque<Duration>>>,
}

impl FakeBackend {
    pub fn with_broker(mut self, credentials: BrokerCredentials) -> Self {
        self.broker = Some(credentials);
        self
    }

    pub fn with_device(mut self, id: u64, device_type: u32, topics: &[(&str, u32)]) -> Self {
        let detail = DeviceDetail {
            sensors_float: topics
                .iter()
                .map(|(topic, sensor_type)| SensorTopic {
                    topic: topic.to_string(),
                    sensor_type: *sensor_type,
                })
                .collect(),
        };
        self.details.insert(DeviceId::from(id), detail);
        self.with_device_without_detail(id, device_type)
    }

    /// Delays successive detail responses by `delays_ms`.
    pub fn with_detail_delays(self, delays_ms: &[u64]) -> Self {
        self.detail_delays
            .lock()
            .unwrap()
            .extend(delays_ms.iter().map(|ms| Duration::from_millis(*ms)));
        self
    }

    /// Device listed by the backend whose detail request fails.
    pub fn with_device_without_detail(mut self, id: u64, device_type: u32) -> Self {
        self.devices.push(Device {
            id: DeviceId::from(id),
            device_type,
            room: None,
            name: format!("device-{}", id),
        });
        self
    }
}

#[async_trait]
impl DeviceBackend for FakeBackend {
    async fn fetch_devices(&self) -> Result<Vec<Device>, ApiError> {
        Ok(self.devices.clone())
    }

    async fn fetch_device_detail(&self, id: &DeviceId) -> Result<DeviceDetail, ApiError> {
        let delay = self.detail_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.details.get(id).cloned().ok_or_else(|| ApiError::Status {
            path: format!("/api/devices/{}", id),
            status: 404,
        })
    }

    async fn fetch_types(&self) -> Result<TypeCatalog, ApiError> {
        Ok(self.types.clone())
    }

    async fn fetch_broker(&self) -> Result<BrokerCredentials, ApiError> {
        self.broker.clone().ok_or_else(|| ApiError::Status {
            path: "/api/broker".to_string(),
            status: 500,
        })
    }
}

/// Polls `condition` until it holds, failing the test after a while.
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next event accepted by `accept`, skipping the others.
pub async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    accept: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT_LIMIT, async {
        loop {
            match events.recv().await {
                Ok(event) if accept(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session event stream closed"),
            }
        }
    })
    .await
    .expect("event not received in time")
}
