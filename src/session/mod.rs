//! # Sync Session
//!
//! The single event loop of the dashboard. One task owns the broker
//! connection, the handler dispatch and every device agent, and processes one
//! input at a time:
//!
//! ```text
//!  REST fetch tasks ──► Fetched ──┐
//!  broker link task ──► BrokerEvent ──► SyncSession loop ──► SessionEvent (broadcast)
//!  SessionHandle ─────► SessionAction ┘        │
//!                        (oneshot reply) ◄─────┘
//! ```
//!
//! Nothing outside the loop mutates device state. Callers use the cloneable
//! [`SessionHandle`]; observers subscribe to [`SessionEvent`]s.

pub mod worker;

pub use worker::SyncSession;

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::api::{Device, DeviceId};
use crate::devices::{AgentState, CommandError, TopicState};
use crate::mqtt::{ConnectionState, PublishOutcome};

/// A new value for one topic of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceUpdate {
    pub device_id: DeviceId,
    pub topic: String,
    pub value: String,
    /// Value with unit, e.g. `23.5 °C`.
    pub display: String,
    pub updated_at: DateTime<Local>,
}

/// Notifications published by the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    DeviceAdded(DeviceId),
    DeviceLoaded {
        device_id: DeviceId,
        topics: Vec<String>,
    },
    DeviceFailed {
        device_id: DeviceId,
        reason: String,
    },
    DeviceRemoved(DeviceId),
    ValueChanged(DeviceUpdate),
}

/// Point-in-time view of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub device: Device,
    pub type_name: Option<String>,
    pub state: AgentState,
    pub pending_input: String,
    pub topics: Vec<(String, TopicState)>,
}

impl DeviceSnapshot {
    pub fn topic(&self, topic: &str) -> Option<&TopicState> {
        self.topics
            .iter()
            .find(|(name, _)| name == topic)
            .map(|(_, state)| state)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("sync session is not running")]
    Closed,
}

// Requests handled by the session loop
#[derive(Debug)]
pub enum SessionAction {
    AddDevice {
        device: Device,
        response_tx: oneshot::Sender<bool>,
    },
    RemoveDevice {
        device_id: DeviceId,
        response_tx: oneshot::Sender<bool>,
    },
    SetInput {
        device_id: DeviceId,
        text: String,
        response_tx: oneshot::Sender<Result<(), CommandError>>,
    },
    PublishCommand {
        device_id: DeviceId,
        topic: String,
        message: Option<String>,
        retain: bool,
        response_tx: oneshot::Sender<Result<PublishOutcome, CommandError>>,
    },
    Snapshot {
        response_tx: oneshot::Sender<Vec<DeviceSnapshot>>,
    },
    ConnectionState {
        response_tx: oneshot::Sender<ConnectionState>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running [`SyncSession`].
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionAction>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<SessionAction>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self { tx, events }
    }

    async fn request<T>(
        &self,
        action: impl FnOnce(oneshot::Sender<T>) -> SessionAction,
    ) -> Result<T, SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(action(response_tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        response_rx.await.map_err(|_| SessionError::Closed)
    }

    /// Creates an agent for `device`. Returns false if it already exists.
    pub async fn add_device(&self, device: Device) -> Result<bool, SessionError> {
        self.request(|response_tx| SessionAction::AddDevice {
            device,
            response_tx,
        })
        .await
    }

    /// Drops the agent, its handler and the topics only it subscribed.
    pub async fn remove_device(&self, device_id: DeviceId) -> Result<bool, SessionError> {
        self.request(|response_tx| SessionAction::RemoveDevice {
            device_id,
            response_tx,
        })
        .await
    }

    pub async fn set_input(
        &self,
        device_id: DeviceId,
        text: impl Into<String>,
    ) -> Result<(), CommandError> {
        let text = text.into();
        self.request(|response_tx| SessionAction::SetInput {
            device_id,
            text,
            response_tx,
        })
        .await
        .map_err(|_| CommandError::SessionClosed)?
    }

    /// Publishes `message`, or the device's pending input when `None`.
    pub async fn publish_command(
        &self,
        device_id: DeviceId,
        topic: impl Into<String>,
        message: Option<String>,
        retain: bool,
    ) -> Result<PublishOutcome, CommandError> {
        let topic = topic.into();
        self.request(|response_tx| SessionAction::PublishCommand {
            device_id,
            topic,
            message,
            retain,
            response_tx,
        })
        .await
        .map_err(|_| CommandError::SessionClosed)?
    }

    pub async fn snapshot(&self) -> Result<Vec<DeviceSnapshot>, SessionError> {
        self.request(|response_tx| SessionAction::Snapshot { response_tx })
            .await
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, SessionError> {
        self.request(|response_tx| SessionAction::ConnectionState { response_tx })
            .await
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Tears the session down. Resolves once the connection is closed and
    /// every handler is unregistered.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|response_tx| SessionAction::Shutdown { response_tx })
            .await
    }
}
