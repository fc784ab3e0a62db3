use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::devices::catalog::TypeCatalog;

/// Device identifier as handed out by the backend.
///
/// The API is not consistent about ids: the device map is keyed by strings
/// while the embedded `id` fields are usually numbers. Both normalise to the
/// decimal string form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for DeviceId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Number(u64),
            Text(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Number(n) => DeviceId(n.to_string()),
            RawId::Text(s) => DeviceId(s),
        })
    }
}

/// A device as listed by `GET /api/devices`. Immutable for the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    #[serde(rename = "type", default)]
    pub device_type: u32,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub name: String,
}

/// One topic a device publishes or accepts, with its sensor type code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorTopic {
    pub topic: String,
    #[serde(rename = "type", default)]
    pub sensor_type: u32,
}

/// Detail of a single device from `GET /api/devices/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDetail {
    #[serde(default)]
    pub sensors_float: Vec<SensorTopic>,
}

/// Broker connection parameters from `GET /api/broker`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub server: String,
    #[serde(
        rename = "websocket",
        alias = "websocket_port",
        deserialize_with = "port_from_number_or_string"
    )]
    pub websocket_port: u16,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("server", &self.server)
            .field("websocket_port", &self.websocket_port)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

fn port_from_number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u16),
        Text(String),
    }

    match RawPort::deserialize(deserializer)? {
        RawPort::Number(port) => Ok(port),
        RawPort::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

// Response envelopes

#[derive(Debug, Deserialize)]
pub(crate) struct DevicesEnvelope {
    pub result: String,
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DetailEnvelope {
    pub result: String,
    #[serde(default)]
    pub device: Option<DeviceDetail>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TypesEnvelope {
    #[serde(default)]
    pub types: Option<TypeCatalog>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_accepts_numbers_and_strings() {
        let numeric: Device = serde_json::from_str(r#"{"id": 7, "type": 3, "name": "Boiler"}"#)
            .unwrap();
        let textual: Device =
            serde_json::from_str(r#"{"id": "7", "type": 3, "name": "Boiler"}"#).unwrap();

        assert_eq!(numeric.id, DeviceId::from(7));
        assert_eq!(numeric, textual);
        assert_eq!(numeric.room, None);
    }

    #[test]
    fn detail_without_sensors_is_empty() {
        let detail: DeviceDetail = serde_json::from_str("{}").unwrap();
        assert!(detail.sensors_float.is_empty());
    }

    #[test]
    fn broker_credentials_read_websocket_key() {
        let creds: BrokerCredentials = serde_json::from_str(
            r#"{"server": "m1.wqtt.ru", "websocket": "8443", "user": "u", "password": "p"}"#,
        )
        .unwrap();

        assert_eq!(creds.websocket_port, 8443);
        assert!(!format!("{:?}", creds).contains("\"p\""));
    }
}
