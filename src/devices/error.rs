//! Error types for device handlers and outbound commands

use thiserror::Error;

use crate::api::DeviceId;
use crate::mqtt::connection::ConnectionError;

/// Failure of a single handler while a message is fanned out.
///
/// Recorded per handler in the dispatch report; never stops delivery to the
/// other handlers of the same message.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("topic registry of device {0} is poisoned")]
    Poisoned(DeviceId),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler rejected message: {0}")]
    Rejected(String),
}

/// Reasons a user command is not forwarded to the broker.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command message is empty")]
    EmptyMessage,

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("device {device} has no topic {topic}")]
    UnknownTopic { device: DeviceId, topic: String },

    #[error("topic {0} is read-only")]
    NotWritable(String),

    #[error("topic registry of device {0} is poisoned")]
    Poisoned(DeviceId),

    #[error("device {0} is already loaded")]
    AlreadyLoaded(DeviceId),

    #[error("broker connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("sync session is not running")]
    SessionClosed,
}
