//! HTTP client for a Prometheus-compatible backend.
//!
//! Queries go to `/api/v1/query` and writes to `/api/v1/write`, both joined
//! onto the configured endpoint path so that installations mounted below a
//! path prefix work unchanged.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use crate::backend::{Backend, VectorSample};
use crate::config::join_path;
use crate::error::BackendError;
use crate::proto::WriteRequest;

/// Longest response body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Prometheus query API and remote-write client.
#[derive(Debug, Clone)]
pub struct PrometheusBackend {
    client: Client,
    query_url: Url,
    write_url: Url,
}

impl PrometheusBackend {
    /// Create a backend for the given base URL.
    ///
    /// `timeout` bounds every HTTP request made by the underlying client.
    pub fn new(endpoint: &Url, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("aranet-promsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(endpoint, client))
    }

    /// Create a backend with a custom reqwest client.
    pub fn with_client(endpoint: &Url, client: Client) -> Self {
        Self {
            client,
            query_url: join_path(endpoint, "api/v1/query"),
            write_url: join_path(endpoint, "api/v1/write"),
        }
    }

    /// URL used for instant queries.
    pub fn query_url(&self) -> &Url {
        &self.query_url
    }

    /// URL used for remote writes.
    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

#[async_trait]
impl Backend for PrometheusBackend {
    async fn instant_query(
        &self,
        query: &str,
        at: OffsetDateTime,
        lookback: Duration,
    ) -> Result<Vec<VectorSample>, BackendError> {
        let time = at
            .format(&Rfc3339)
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        let lookback_delta = format!("{}s", lookback.as_secs());

        let response = self
            .client
            .get(self.query_url.clone())
            .query(&[
                ("query", query),
                ("time", time.as_str()),
                ("lookback_delta", lookback_delta.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let envelope: ApiResponse = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(BackendError::Status {
                    status: status.as_u16(),
                    body: truncate(&body),
                });
            }
            Err(e) => {
                return Err(BackendError::InvalidResponse(format!(
                    "decoding query response: {e}"
                )));
            }
        };

        if envelope.status != "success" {
            return Err(BackendError::Api {
                error_type: envelope.error_type.unwrap_or_default(),
                message: envelope.error.unwrap_or_default(),
            });
        }
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }
        for warning in envelope.warnings.unwrap_or_default() {
            warn!(query, %warning, "warning querying metric");
        }

        let data = envelope
            .data
            .ok_or_else(|| BackendError::InvalidResponse("response has no data".to_string()))?;
        debug!(query, result_type = %data.result_type, "query result");
        if data.result_type != "vector" {
            return Err(BackendError::UnexpectedResultType(data.result_type));
        }

        let raw: Vec<RawVectorSample> = serde_json::from_value(data.result)
            .map_err(|e| BackendError::InvalidResponse(format!("decoding vector: {e}")))?;
        raw.into_iter().map(VectorSample::try_from).collect()
    }

    async fn write(&self, request: &WriteRequest) -> Result<(), BackendError> {
        let body = request.to_snappy()?;
        let response = self
            .client
            .post(self.write_url.clone())
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/x-protobuf")
            .header("X-Prometheus-Remote-Write-Version", "0.1.0")
            .body(body)
            .send()
            .await?;
        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<(), BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body: truncate(&body),
    })
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// Query API response envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawVectorSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: Option<(f64, String)>,
}

impl TryFrom<RawVectorSample> for VectorSample {
    type Error = BackendError;

    fn try_from(raw: RawVectorSample) -> Result<Self, Self::Error> {
        let (timestamp, value) = raw
            .value
            .ok_or_else(|| BackendError::InvalidResponse("vector sample has no value".to_string()))?;
        let value = value
            .parse::<f64>()
            .map_err(|e| BackendError::InvalidResponse(format!("sample value {value:?}: {e}")))?;
        Ok(Self {
            metric: raw.metric,
            timestamp,
            value,
        })
    }
}
