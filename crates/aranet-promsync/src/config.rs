//! Sync engine configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Url;

use crate::error::{Result, SyncError};

/// How far back a cold-cache lookup searches for a previously written sample.
///
/// Aranet4 devices keep roughly 30 days of history on board, so nothing older
/// can ever be offered for writing again.
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default budget for a single instant query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default budget for a single remote write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a [`crate::Syncer`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the Prometheus instance (e.g. `http://localhost:9090/`).
    pub endpoint: String,
    /// Prefix prepended to every metric name (e.g. `aranet4_`).
    pub metric_prefix: String,
    /// Identifying labels added to every series (`job`, `instance`, ...).
    pub labels: BTreeMap<String, String>,
    /// Log writes instead of sending them.
    ///
    /// A logged write still advances the high-water mark and is counted
    /// with `status="success"` in the write counter.
    pub dry_run: bool,
    /// Budget for each instant query.
    pub query_timeout: Duration,
    /// Budget for each remote write.
    pub write_timeout: Duration,
    /// Lookback window for cold-cache lookups.
    pub lookback: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9090/".to_string(),
            metric_prefix: "aranet4_".to_string(),
            labels: BTreeMap::new(),
            dry_run: false,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            lookback: DEFAULT_LOOKBACK,
        }
    }
}

impl SyncConfig {
    /// Create a config for the given endpoint with default settings.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the metric prefix.
    #[must_use]
    pub fn metric_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.metric_prefix = prefix.into();
        self
    }

    /// Add an identifying label.
    #[must_use]
    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Enable or disable dry-run mode.
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Parse and check the endpoint URL.
    ///
    /// The endpoint is required and must carry both a scheme and a host.
    pub fn endpoint_url(&self) -> Result<Url> {
        if self.endpoint.is_empty() {
            return Err(SyncError::InvalidConfig(
                "Prometheus endpoint is required".to_string(),
            ));
        }
        let url = Url::parse(&self.endpoint).map_err(|e| {
            SyncError::InvalidConfig(format!("failed to parse URL {:?}: {}", self.endpoint, e))
        })?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(SyncError::InvalidConfig(format!(
                "URL {:?} has no host",
                self.endpoint
            )));
        }
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::InvalidConfig(format!(
                "URL {:?} has unsupported scheme {:?}",
                self.endpoint,
                url.scheme()
            )));
        }
        Ok(url)
    }
}

/// Append `suffix` to the path of `base`, keeping any path prefix the
/// endpoint already has (e.g. a reverse proxy mount point).
pub(crate) fn join_path(base: &Url, suffix: &str) -> Url {
    let mut url = base.clone();
    let path = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        suffix.trim_start_matches('/')
    );
    url.set_path(&path);
    url.set_query(None);
    url
}
