use chrono::NaiveDateTime;
use std::fmt;

/// One publish received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: NaiveDateTime,
}

impl fmt::Display for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(10).collect();
        write!(f, "{} - {}", self.received_at, preview)
    }
}

impl BrokerMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        BrokerMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: chrono::Local::now().naive_local(),
        }
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.received_at, self.topic, self.payload)
    }
}

/// What the broker link reports to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// ConnAck received; subscriptions must be (re)issued.
    Connected,
    /// The link dropped after having been connected.
    Disconnected,
    Message(BrokerMessage),
}
