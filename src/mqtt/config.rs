use rumqttc::{MqttOptions, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::reconnect::ReconnectPolicy;
use crate::api::BrokerCredentials;

/// User-tunable broker settings, part of the app config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Path of the MQTT endpoint on the websocket server.
    pub websocket_path: String,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    /// Capacity of the rumqttc request queue and of the event channel.
    pub channel_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            websocket_path: "/mqtt".to_string(),
            client_id_prefix: "mqttdash".to_string(),
            keep_alive_secs: 60,
            channel_capacity: 100,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Everything needed to open one broker link.
#[derive(Clone, PartialEq)]
pub struct MqttConfig {
    pub broker_url: String,
    pub port: u16,
    pub client_id: String,
    pub user: String,
    pub password: String,
    pub keep_alive: Duration,
    pub channel_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("broker_url", &self.broker_url)
            .field("client_id", &self.client_id)
            .field("user", &self.user)
            .field("keep_alive", &self.keep_alive)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

impl MqttConfig {
    pub fn from_credentials(credentials: &BrokerCredentials, settings: &BrokerSettings) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        MqttConfig {
            broker_url: websocket_url(
                &credentials.server,
                credentials.websocket_port,
                &settings.websocket_path,
            ),
            port: credentials.websocket_port,
            client_id: format!("{}_{}", settings.client_id_prefix, &suffix[..8]),
            user: credentials.user.clone(),
            password: credentials.password.clone(),
            keep_alive: Duration::from_secs(settings.keep_alive_secs.max(5)),
            channel_capacity: settings.channel_capacity.max(1),
            reconnect: settings.reconnect.clone(),
        }
    }

    /// rumqttc options for a secure websocket session.
    ///
    /// The dashboard broker expects the legacy `MQIsdp` protocol name at
    /// level 3. rumqttc always sends `MQTT` at level 4 (3.1.1) and does not
    /// expose the protocol level, so a broker that only accepts 3.1 refuses
    /// the ConnAck.
    pub fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.broker_url, self.port);
        options
            .set_transport(Transport::wss_with_default_config())
            .set_credentials(self.user.clone(), self.password.clone())
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true);
        options
    }
}

fn websocket_url(server: &str, port: u16, path: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        format!("wss://{}:{}", server, port)
    } else if path.starts_with('/') {
        format!("wss://{}:{}{}", server, port, path)
    } else {
        format!("wss://{}:{}/{}", server, port, path)
    }
}
