//! Real-time MQTT dashboard core.
//!
//! Device metadata and broker credentials come from a REST backend
//! ([`api`]); values arrive over a websocket MQTT connection ([`mqtt`]) and
//! are routed to per-device state ([`devices`]). The [`session`] loop ties the
//! pieces together and is the only owner of mutable state.

pub mod api;
pub mod config;
pub mod console;
pub mod devices;
pub mod mqtt;
pub mod persistence;
pub mod session;

#[cfg(test)]
mod testing;
