//! # Device State and Message Routing
//!
//! The per-device half of the sync core. A [`DeviceAgent`] owns the topics of
//! one device and their last known values ([`TopicRegistry`]); the
//! [`HandlerDispatch`] routes every inbound broker message to the handlers of
//! the devices that own its topic.
//!
//! ```text
//! broker message ──► HandlerDispatch ──► TopicHandler (device 1) ──► TopicRegistry
//!   (topic, payload)   topic → {ids}  └─► TopicHandler (device 7) ──► TopicRegistry
//! ```
//!
//! Sensor capabilities (unit, writability) come from the [`TypeCatalog`]
//! instead of being scattered as numeric literals through the routing code.

pub mod agent;
pub mod catalog;
pub mod dispatch;
pub mod error;
pub mod registry;

pub use agent::{AgentState, DeviceAgent, TopicHandler};
pub use catalog::{SensorCapability, TypeCatalog};
pub use dispatch::{DispatchReport, HandlerDispatch, MessageHandler};
pub use error::{CommandError, HandlerError};
pub use registry::{SharedTopics, TopicRegistry, TopicState};
