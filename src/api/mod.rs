//! # REST Backend Integration
//!
//! Everything the dashboard learns about devices and the broker comes from the
//! vendor REST API. This module holds the wire models and a thin `reqwest`
//! client behind the [`DeviceBackend`] trait so the sync session can be driven
//! by an in-memory backend in tests.
//!
//! ```text
//! api/
//! ├── models.rs  - Device, DeviceDetail, BrokerCredentials and response envelopes
//! └── client.rs  - DeviceBackend trait and the HTTP implementation
//! ```
//!
//! Every request carries `Authorization: Token <token>`. The token is the only
//! credential the client owns; broker credentials are fetched, never stored.

pub mod client;
pub mod models;

pub use client::{ApiClient, DeviceBackend};
pub use models::{BrokerCredentials, Device, DeviceDetail, DeviceId, SensorTopic};

use thiserror::Error;

/// Failures of a single REST call.
///
/// None of these are retried. The session logs them and degrades to "no data"
/// for whatever the call was supposed to provide.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no API token configured")]
    MissingToken,

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{path} returned HTTP {status}")]
    Status { path: String, status: u16 },

    #[error("{path} answered with result {result:?}")]
    Rejected { path: String, result: String },

    #[error("{path} response is missing `{field}`")]
    MissingField { path: String, field: &'static str },
}
