//! # MQTT Integration Module
//!
//! Owns the one broker connection of a sync session. The broker is reached
//! over a secure websocket with the credentials fetched from the REST
//! backend; inbound publishes are forwarded, in transport order, as
//! [`BrokerEvent`]s to the session loop.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs      - Broker settings and rumqttc option building
//! ├── message.rs     - Inbound message and event representation
//! ├── reconnect.rs   - Backoff policy for dropped connections
//! ├── connection.rs  - ConnectionManager: connect, subscribe, publish, close
//! └── link.rs        - statum state machine driving the rumqttc event loop
//! ```
//!
//! ## Connection Lifecycle
//!
//! ```text
//! Connecting ──► Connected ──► Reconnecting ──► Connecting ...
//!     │              │               │
//!     └──────────────┴───────────────┴──► Closed (cancelled or attempts exhausted)
//! ```
//!
//! Only one link is live per credential set. Requesting a connection with new
//! credentials closes the previous link before the new one is opened.
//! Publishing while not connected is a silent no-op; subscriptions are
//! remembered and replayed after every ConnAck.

pub mod config;
pub mod connection;
pub mod link;
pub mod message;
pub mod reconnect;

pub use config::{BrokerSettings, MqttConfig};
pub use connection::{
    BrokerConnector, BrokerTransport, ConnectOutcome, ConnectionError, ConnectionManager,
    ConnectionState, PublishOutcome, RumqttConnector,
};
pub use message::{BrokerEvent, BrokerMessage};
pub use reconnect::ReconnectPolicy;
