use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::catalog::TypeCatalog;
use super::dispatch::MessageHandler;
use super::error::{CommandError, HandlerError};
use super::registry::{SharedTopics, TopicRegistry, TopicState};
use crate::api::{Device, DeviceDetail, DeviceId};
use crate::mqtt::connection::{ConnectionManager, PublishOutcome};
use crate::session::{DeviceSnapshot, DeviceUpdate, SessionEvent};

/// Lifecycle of a device agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AgentState {
    /// Handler registered, detail fetch pending.
    #[default]
    Registered,
    /// Detail loaded, topics tracked and subscribed.
    Loaded,
    /// Detail fetch failed; the device never receives values.
    Failed,
}

/// Per-device owner of topic subscriptions and latest values.
pub struct DeviceAgent {
    device: Device,
    state: AgentState,
    topics: SharedTopics,
    pending_input: String,
    // detail fetches started for an older agent with the same id carry
    // a different generation
    generation: u64,
}

impl DeviceAgent {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            state: AgentState::Registered,
            topics: TopicRegistry::new().shared(),
            pending_input: String::new(),
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn id(&self) -> &DeviceId {
        &self.device.id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Builds the message handler to register for this device.
    ///
    /// The handler shares the agent's topic map and publishes value changes
    /// to `events`.
    pub fn handler(&self, events: broadcast::Sender<SessionEvent>) -> TopicHandler {
        TopicHandler {
            device_id: self.device.id.clone(),
            topics: self.topics.clone(),
            events,
        }
    }

    /// Tracks every topic of `detail` with an empty value.
    ///
    /// A loaded agent keeps its values; loading it again is an error.
    ///
    /// Returns the topics the caller must route and subscribe.
    pub fn load(
        &mut self,
        detail: &DeviceDetail,
        catalog: &TypeCatalog,
    ) -> Result<Vec<String>, CommandError> {
        if self.state == AgentState::Loaded {
            return Err(CommandError::AlreadyLoaded(self.device.id.clone()));
        }
        let mut registry = self
            .topics
            .write()
            .map_err(|_| CommandError::Poisoned(self.device.id.clone()))?;

        let mut topics = Vec::with_capacity(detail.sensors_float.len());
        for sensor in &detail.sensors_float {
            debug!(
                "Device {} tracks {} (type {})",
                self.device.id, sensor.topic, sensor.sensor_type
            );
            let state = TopicState::new(self.device.id.clone(), catalog.sensor(sensor.sensor_type));
            registry.track(sensor.topic.clone(), state);
            topics.push(sensor.topic.clone());
        }
        drop(registry);

        self.state = AgentState::Loaded;
        info!(
            "Device {} ({}) loaded with {} topics",
            self.device.id,
            self.device.name,
            topics.len()
        );
        Ok(topics)
    }

    pub fn mark_failed(&mut self) {
        self.state = AgentState::Failed;
    }

    pub fn refresh_capabilities(&self, catalog: &TypeCatalog) {
        match self.topics.write() {
            Ok(mut registry) => registry.refresh_capabilities(catalog),
            Err(_) => warn!("Topic registry of device {} is poisoned", self.device.id),
        }
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.pending_input = text.into();
    }

    pub fn pending_input(&self) -> &str {
        &self.pending_input
    }

    /// Current value of `topic`, if tracked.
    pub fn topic_state(&self, topic: &str) -> Option<TopicState> {
        self.topics
            .read()
            .ok()
            .and_then(|registry| registry.get(topic).cloned())
    }

    /// Checks that `message` may be published to `topic` by this device.
    pub fn check_command(&self, topic: &str, message: &str) -> Result<(), CommandError> {
        if message.is_empty() {
            return Err(CommandError::EmptyMessage);
        }
        let registry = self
            .topics
            .read()
            .map_err(|_| CommandError::Poisoned(self.device.id.clone()))?;
        let state = registry
            .get(topic)
            .ok_or_else(|| CommandError::UnknownTopic {
                device: self.device.id.clone(),
                topic: topic.to_string(),
            })?;
        if !state.writable {
            return Err(CommandError::NotWritable(topic.to_string()));
        }
        Ok(())
    }

    /// Publishes a command to one of the device's writable topics.
    ///
    /// Without an explicit `message` the pending input is sent. The pending
    /// input is cleared once the message was handed to the transport; a
    /// `Dropped` publish (not connected) keeps it.
    pub fn publish_command(
        &mut self,
        connection: &ConnectionManager,
        topic: &str,
        message: Option<&str>,
        retain: bool,
    ) -> Result<PublishOutcome, CommandError> {
        let message = match message {
            Some(message) => message.to_string(),
            None => self.pending_input.clone(),
        };
        self.check_command(topic, &message)?;

        let outcome = connection.publish(topic, &message, retain)?;
        match outcome {
            PublishOutcome::Sent => {
                info!(
                    "Message \"{}\" sent to {} with retain={}",
                    message, topic, retain
                );
                self.pending_input.clear();
            }
            PublishOutcome::Dropped => {
                debug!("Command for {} dropped, broker not connected", topic);
            }
        }
        Ok(outcome)
    }

    pub fn snapshot(&self, catalog: &TypeCatalog) -> DeviceSnapshot {
        let topics = self
            .topics
            .read()
            .map(|registry| {
                registry
                    .iter()
                    .map(|(topic, state)| (topic.clone(), state.clone()))
                    .collect()
            })
            .unwrap_or_default();

        DeviceSnapshot {
            device: self.device.clone(),
            type_name: catalog
                .device_type_name(self.device.device_type)
                .map(str::to_string),
            state: self.state,
            pending_input: self.pending_input.clone(),
            topics,
        }
    }
}

/// Message handler of one device, registered with the dispatch.
pub struct TopicHandler {
    device_id: DeviceId,
    topics: SharedTopics,
    events: broadcast::Sender<SessionEvent>,
}

impl MessageHandler for TopicHandler {
    fn on_message(&mut self, topic: &str, payload: &str) -> Result<bool, HandlerError> {
        let mut registry = self
            .topics
            .write()
            .map_err(|_| HandlerError::Poisoned(self.device_id.clone()))?;

        let Some(state) = registry.apply(topic, payload) else {
            return Ok(false);
        };
        let update = DeviceUpdate {
            device_id: self.device_id.clone(),
            topic: topic.to_string(),
            value: state.value.clone(),
            display: state.display().unwrap_or_default(),
            updated_at: state.updated_at.unwrap_or_else(chrono::Local::now),
        };
        drop(registry);

        debug!("{} {}", topic, payload);
        // Nobody listening is fine
        let _ = self.events.send(SessionEvent::ValueChanged(update));
        Ok(true)
    }
}
