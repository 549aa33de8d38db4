//! Where readings come from.
//!
//! A [`ReadingSource`] produces the latest reading plus the device's stored
//! history. Records may be unsorted and may contain sentinel values; the
//! collector validates them before syncing.
//!
//! [`ServiceSource`] reads from a running `aranet-service` over its REST API.
//! [`crate::mock::MockSource`] is an in-memory source for tests and demos.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::debug;

use aranet_types::Reading;

use crate::passkey::PasskeyError;

/// Result of one acquisition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Acquisition {
    /// The device's current reading, if it reported one.
    pub latest: Option<Reading>,
    /// Stored history records, in no particular order.
    pub history: Vec<Reading>,
}

/// Errors raised while acquiring readings.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    /// Pairing with the device failed.
    #[error("pairing: {0}")]
    Pairing(#[from] PasskeyError),

    /// The reading source is not reachable.
    #[error("source not reachable at {url}: {source}")]
    NotReachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The source answered with an error.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid source URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The device layer reported a failure.
    #[error("device error: {0}")]
    Device(String),

    /// Acquisition did not finish in time.
    #[error("acquisition timed out after {0:?}")]
    Timeout(Duration),
}

/// A producer of device readings.
#[async_trait]
pub trait ReadingSource: Send + Sync {
    /// Read the latest reading and the stored history.
    async fn acquire(&self) -> Result<Acquisition, AcquisitionError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Reads from the `aranet-service` REST API.
///
/// Uses `GET /api/devices/{id}/current` and `GET /api/devices/{id}/history`.
#[derive(Debug, Clone)]
pub struct ServiceSource {
    client: Client,
    base_url: Url,
    device_id: String,
}

impl ServiceSource {
    /// Create a source for `device_id` on the service at `base_url`.
    pub fn new(base_url: &str, device_id: &str, timeout: Duration) -> Result<Self, AcquisitionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AcquisitionError::Request)?;
        Self::with_client(base_url, device_id, client)
    }

    /// Create a source with a custom reqwest client.
    pub fn with_client(
        base_url: &str,
        device_id: &str,
        client: Client,
    ) -> Result<Self, AcquisitionError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AcquisitionError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(AcquisitionError::InvalidUrl(format!(
                "URL must start with http:// or https://, got: {base_url}"
            )));
        }
        Ok(Self {
            client,
            base_url,
            device_id: device_id.to_string(),
        })
    }

    /// The URL of a per-device endpoint, with the device ID escaped.
    pub fn device_url(&self, endpoint: &str) -> Result<Url, AcquisitionError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AcquisitionError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "devices", self.device_id.as_str(), endpoint]);
        Ok(url)
    }

    async fn current(&self) -> Result<Option<Reading>, AcquisitionError> {
        let url = self.device_url("current")?;
        match self.get::<ServiceReading>(url).await {
            Ok(reading) => Ok(Some(reading.into())),
            // The service answers 404 until it has collected a first reading.
            Err(AcquisitionError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn history(&self) -> Result<Vec<Reading>, AcquisitionError> {
        let url = self.device_url("history")?;
        let page: HistoryPage = self.get(url).await?;
        Ok(page.data.into_iter().map(Reading::from).collect())
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, AcquisitionError> {
        debug!(%url, "fetching");
        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            AcquisitionError::NotReachable {
                url: url.to_string(),
                source: e,
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(AcquisitionError::Request);
        }
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
        Err(AcquisitionError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ReadingSource for ServiceSource {
    async fn acquire(&self) -> Result<Acquisition, AcquisitionError> {
        let latest = self.current().await?;
        let history = self.history().await?;
        Ok(Acquisition { latest, history })
    }

    fn describe(&self) -> String {
        format!("aranet-service at {} (device {})", self.base_url, self.device_id)
    }
}

/// `GET /api/devices/{id}/current` body.
#[derive(Debug, Deserialize)]
struct ServiceReading {
    #[serde(with = "time::serde::rfc3339")]
    captured_at: OffsetDateTime,
    co2: i32,
    temperature: f64,
    pressure: f64,
    humidity: f64,
    #[serde(default)]
    battery: Option<u8>,
}

impl From<ServiceReading> for Reading {
    fn from(r: ServiceReading) -> Self {
        Reading {
            timestamp: r.captured_at,
            co2: r.co2,
            temperature: r.temperature,
            pressure: r.pressure,
            humidity: r.humidity,
            battery: r.battery,
        }
    }
}

/// `GET /api/devices/{id}/history` body.
#[derive(Debug, Deserialize)]
struct HistoryPage {
    data: Vec<ServiceHistoryRecord>,
}

#[derive(Debug, Deserialize)]
struct ServiceHistoryRecord {
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    co2: i32,
    temperature: f64,
    pressure: f64,
    humidity: f64,
}

impl From<ServiceHistoryRecord> for Reading {
    fn from(r: ServiceHistoryRecord) -> Self {
        Reading {
            timestamp: r.timestamp,
            co2: r.co2,
            temperature: r.temperature,
            pressure: r.pressure,
            humidity: r.humidity,
            battery: None,
        }
    }
}
