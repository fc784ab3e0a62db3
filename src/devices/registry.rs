use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::catalog::{SensorCapability, TypeCatalog};
use crate::api::DeviceId;

/// Topic map shared between a device agent and its message handler.
///
/// Both sides only ever run on the session task, so the lock is uncontended;
/// it exists to give the handler a `Send` view of the agent's state.
pub type SharedTopics = Arc<RwLock<TopicRegistry>>;

/// Last known state of one topic of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicState {
    pub device_id: DeviceId,
    pub sensor_type: u32,
    pub unit: Option<String>,
    pub writable: bool,
    /// Empty until the first message arrives.
    pub value: String,
    pub updated_at: Option<DateTime<Local>>,
}

impl TopicState {
    pub fn new(device_id: DeviceId, capability: SensorCapability) -> Self {
        Self {
            device_id,
            sensor_type: capability.code,
            unit: capability.unit,
            writable: capability.writable,
            value: String::new(),
            updated_at: None,
        }
    }

    pub fn has_value(&self) -> bool {
        !self.value.is_empty()
    }

    /// Value with its unit, e.g. `23.5 °C`. `None` while no value arrived.
    pub fn display(&self) -> Option<String> {
        if !self.has_value() {
            return None;
        }
        Some(match &self.unit {
            Some(unit) if !unit.is_empty() => format!("{} {}", self.value, unit),
            _ => self.value.clone(),
        })
    }

    fn apply_capability(&mut self, capability: SensorCapability) {
        self.unit = capability.unit;
        self.writable = capability.writable;
    }
}

/// Topics of one device keyed by topic string.
#[derive(Debug, Default, Clone)]
pub struct TopicRegistry {
    entries: BTreeMap<String, TopicState>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedTopics {
        Arc::new(RwLock::new(self))
    }

    /// Starts tracking `topic`. An existing entry is reset to an empty value.
    pub fn track(&mut self, topic: impl Into<String>, state: TopicState) {
        self.entries.insert(topic.into(), state);
    }

    /// Stores `payload` as the new value of `topic`.
    ///
    /// Returns `None` when the topic is not tracked; that is not an error.
    pub fn apply(&mut self, topic: &str, payload: &str) -> Option<&TopicState> {
        let state = self.entries.get_mut(topic)?;
        state.value = payload.to_string();
        state.updated_at = Some(Local::now());
        Some(state)
    }

    pub fn refresh_capabilities(&mut self, catalog: &TypeCatalog) {
        for state in self.entries.values_mut() {
            state.apply_capability(catalog.sensor(state.sensor_type));
        }
    }

    pub fn get(&self, topic: &str) -> Option<&TopicState> {
        self.entries.get(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TopicState)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
