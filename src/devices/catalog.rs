use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Built-in sensor table: (type code, unit, writable).
///
/// Used for every code the backend catalog does not describe.
const BUILTIN_SENSORS: &[(u32, &str, bool)] = &[
    (0, "°C", false),
    (1, "%", false),
    (2, "PPM", false),
    (17, "kW", true),
    (18, "m³", true),
    (20, "m³", true),
];

/// Type catalog from `GET /api/devices/types`.
///
/// Keys are numeric type codes (sent as JSON object keys). Unknown fields are
/// ignored so the backend can grow the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeCatalog {
    #[serde(default)]
    pub device: HashMap<u32, DeviceTypeInfo>,
    #[serde(default)]
    pub sensor: HashMap<u32, SensorTypeInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTypeInfo {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorTypeInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub writable: Option<bool>,
}

/// Resolved display and control metadata for one sensor type code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorCapability {
    pub code: u32,
    pub unit: Option<String>,
    pub writable: bool,
}

impl TypeCatalog {
    /// Resolves a sensor code: catalog fields win, the built-in table fills gaps.
    pub fn sensor(&self, code: u32) -> SensorCapability {
        let builtin = BUILTIN_SENSORS.iter().find(|(c, _, _)| *c == code);
        let mut capability = SensorCapability {
            code,
            unit: builtin.map(|(_, unit, _)| unit.to_string()),
            writable: builtin.map(|(_, _, writable)| *writable).unwrap_or(false),
        };

        if let Some(info) = self.sensor.get(&code) {
            if let Some(unit) = &info.unit {
                capability.unit = Some(unit.clone());
            }
            if let Some(writable) = info.writable {
                capability.writable = writable;
            }
        }

        capability
    }

    pub fn device_type_name(&self, code: u32) -> Option<&str> {
        self.device
            .get(&code)
            .map(|info| info.name.as_str())
            .filter(|name| !name.is_empty())
    }
}
