//! Topic-indexed fan-out of inbound broker messages
//!
//! Each device registers exactly one handler. Topics are routed to device ids
//! once the device has subscribed them, so a message only reaches the
//! handlers that own its topic. Every handler call runs in its own failure
//! boundary: an error or a panic in one device never suppresses delivery to
//! the others.

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

use super::error::HandlerError;
use crate::api::DeviceId;

/// Consumer of broker messages for one device.
///
/// Returns `Ok(true)` when the message changed state, `Ok(false)` when the
/// topic is not one the handler owns.
pub trait MessageHandler: Send {
    fn on_message(&mut self, topic: &str, payload: &str) -> Result<bool, HandlerError>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&str, &str) -> Result<bool, HandlerError> + Send,
{
    fn on_message(&mut self, topic: &str, payload: &str) -> Result<bool, HandlerError> {
        self(topic, payload)
    }
}

/// Outcome of dispatching one message.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Handlers the topic was routed to.
    pub routed: usize,
    /// Devices whose state changed.
    pub applied: Vec<DeviceId>,
    /// Handlers that failed, in routing order.
    pub failed: Vec<(DeviceId, HandlerError)>,
}

#[derive(Default)]
pub struct HandlerDispatch {
    handlers: HashMap<DeviceId, Box<dyn MessageHandler>>,
    routes: HashMap<String, BTreeSet<DeviceId>>,
}

impl HandlerDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the handler for `device_id`, replacing a previous one.
    ///
    /// Returns `true` when a handler was replaced. Routes are kept.
    pub fn register<H>(&mut self, device_id: DeviceId, handler: H) -> bool
    where
        H: MessageHandler + 'static,
    {
        let replaced = self
            .handlers
            .insert(device_id.clone(), Box::new(handler))
            .is_some();
        if replaced {
            debug!("Replaced message handler of device {}", device_id);
        } else {
            debug!("Registered message handler of device {}", device_id);
        }
        replaced
    }

    /// Removes the handler of `device_id` and all of its routes.
    ///
    /// Returns the topics no device routes anymore, sorted.
    pub fn unregister(&mut self, device_id: &DeviceId) -> Vec<String> {
        if self.handlers.remove(device_id).is_none() {
            return Vec::new();
        }

        let mut orphaned = Vec::new();
        self.routes.retain(|topic, devices| {
            devices.remove(device_id);
            if devices.is_empty() {
                orphaned.push(topic.clone());
                false
            } else {
                true
            }
        });
        orphaned.sort();

        debug!(
            "Unregistered device {} ({} topics orphaned)",
            device_id,
            orphaned.len()
        );
        orphaned
    }

    /// Routes `topic` to the handler of `device_id`.
    ///
    /// Returns `false` when the route already existed.
    pub fn route(&mut self, device_id: &DeviceId, topic: &str) -> bool {
        self.routes
            .entry(topic.to_string())
            .or_default()
            .insert(device_id.clone())
    }

    pub fn is_registered(&self, device_id: &DeviceId) -> bool {
        self.handlers.contains_key(device_id)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn routed_devices(&self, topic: &str) -> Vec<DeviceId> {
        self.routes
            .get(topic)
            .map(|devices| devices.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Delivers one message to every handler routed to `topic`.
    pub fn dispatch(&mut self, topic: &str, payload: &str) -> DispatchReport {
        let mut report = DispatchReport::default();
        let Some(devices) = self.routes.get(topic) else {
            debug!("No device routes topic {}", topic);
            return report;
        };

        for device_id in devices {
            let Some(handler) = self.handlers.get_mut(device_id) else {
                continue;
            };
            report.routed += 1;

            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(topic, payload)));
            match outcome {
                Ok(Ok(true)) => report.applied.push(device_id.clone()),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    warn!("Handler of device {} failed on {}: {}", device_id, topic, e);
                    report.failed.push((device_id.clone(), e));
                }
                Err(panic) => {
                    let reason = panic_reason(panic.as_ref());
                    error!(
                        "Handler of device {} panicked on {}: {}",
                        device_id, topic, reason
                    );
                    report
                        .failed
                        .push((device_id.clone(), HandlerError::Panicked(reason)));
                }
            }
        }

        report
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
        self.routes.clear();
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
