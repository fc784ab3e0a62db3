use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

use super::models::{DetailEnvelope, DevicesEnvelope, TypesEnvelope};
use super::{ApiError, BrokerCredentials, Device, DeviceDetail, DeviceId};
use crate::config::ApiConfig;
use crate::devices::catalog::TypeCatalog;

const DEVICES_PATH: &str = "/api/devices";
const TYPES_PATH: &str = "/api/devices/types";
const BROKER_PATH: &str = "/api/broker";

/// Source of device metadata and broker credentials.
///
/// The session only talks to the backend through this trait; each call is
/// issued from its own task and its result is fed back into the session loop.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    async fn fetch_devices(&self) -> Result<Vec<Device>, ApiError>;

    async fn fetch_device_detail(&self, id: &DeviceId) -> Result<DeviceDetail, ApiError>;

    async fn fetch_types(&self) -> Result<TypeCatalog, ApiError>;

    async fn fetch_broker(&self) -> Result<BrokerCredentials, ApiError>;
}

/// HTTP implementation of [`DeviceBackend`].
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, token: impl Into<String>) -> Result<Self, ApiError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ApiError::MissingToken);
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        info!("REST client targeting {}", config.base_url);
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        debug!("GET {}", path);
        let response = self
            .client
            .get(self.url(path))
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl DeviceBackend for ApiClient {
    async fn fetch_devices(&self) -> Result<Vec<Device>, ApiError> {
        let envelope: DevicesEnvelope = self.get_json(DEVICES_PATH).await?;
        unpack_devices(envelope)
    }

    async fn fetch_device_detail(&self, id: &DeviceId) -> Result<DeviceDetail, ApiError> {
        let path = format!("{}/{}", DEVICES_PATH, id);
        let envelope: DetailEnvelope = self.get_json(&path).await?;
        unpack_detail(&path, envelope)
    }

    async fn fetch_types(&self) -> Result<TypeCatalog, ApiError> {
        let envelope: TypesEnvelope = self.get_json(TYPES_PATH).await?;
        envelope.types.ok_or(ApiError::MissingField {
            path: TYPES_PATH.to_string(),
            field: "types",
        })
    }

    async fn fetch_broker(&self) -> Result<BrokerCredentials, ApiError> {
        self.get_json(BROKER_PATH).await
    }
}

fn unpack_devices(envelope: DevicesEnvelope) -> Result<Vec<Device>, ApiError> {
    if envelope.result != "ok" {
        return Err(ApiError::Rejected {
            path: DEVICES_PATH.to_string(),
            result: envelope.result,
        });
    }
    Ok(envelope.devices.into_values().collect())
}

fn unpack_detail(path: &str, envelope: DetailEnvelope) -> Result<DeviceDetail, ApiError> {
    if envelope.result != "ok" {
        return Err(ApiError::Rejected {
            path: path.to_string(),
            result: envelope.result,
        });
    }
    envelope.device.ok_or(ApiError::MissingField {
        path: path.to_string(),
        field: "device",
    })
}
