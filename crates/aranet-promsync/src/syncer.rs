//! The deduplicating sync engine.
//!
//! [`Syncer`] remembers, per metric, the timestamp of the last sample it
//! wrote (the high-water mark) and only forwards samples that are strictly
//! newer. The first time a metric is seen in a process the mark is looked up
//! in the backend itself, so a restarted collector neither re-sends history the
//! backend already holds nor needs any local persistence.
//!
//! # Concurrency
//!
//! The cache lock is held for the whole resolve → compare → write → update
//! sequence. Concurrent callers are therefore serialized, which keeps the
//! duplicate check and the mark update atomic with respect to each other.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use aranet_types::{Sample, is_zero_time};

use crate::backend::Backend;
use crate::config::SyncConfig;
use crate::error::{BackendError, Result, SyncError};
use crate::labels::LabelSet;
use crate::metrics::{WriteMetrics, WriteOutcome};
use crate::proto::{self, WriteRequest};
use crate::remote::PrometheusBackend;

/// How far ahead of the wall clock a sample may be.
///
/// A sample from the far future would become the high-water mark and make
/// every later legitimate sample look stale.
pub const MAX_FUTURE_SKEW: Duration = Duration::from_secs(60 * 60);

/// Successful result of [`Syncer::report_metric`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The sample was sent (or logged, in dry-run mode) and the mark advanced.
    Written,
    /// The sample was not newer than the mark; nothing was sent.
    Skipped,
}

/// Writes samples to Prometheus, skipping anything already written.
pub struct Syncer {
    backend: Arc<dyn Backend>,
    config: SyncConfig,
    metrics: WriteMetrics,
    /// Last written timestamp per metric (without prefix).
    last_times: Mutex<HashMap<String, OffsetDateTime>>,
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Syncer {
    /// Create a syncer talking to the configured Prometheus endpoint.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let endpoint = config.endpoint_url()?;
        let request_timeout = config.query_timeout.max(config.write_timeout);
        let backend = PrometheusBackend::new(&endpoint, request_timeout)
            .map_err(|e| SyncError::InvalidConfig(format!("creating HTTP client: {e}")))?;
        debug!(
            write_url = %backend.write_url(),
            prefix = %config.metric_prefix,
            labels = ?config.labels,
            "Prometheus syncer created"
        );
        Self::with_backend(config, Arc::new(backend))
    }

    /// Create a syncer using a custom backend.
    pub fn with_backend(config: SyncConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        config.endpoint_url()?;
        let metrics = WriteMetrics::new(&config.metric_prefix)?;
        Ok(Self {
            backend,
            config,
            metrics,
            last_times: Mutex::new(HashMap::new()),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Write outcome counters.
    pub fn metrics(&self) -> &WriteMetrics {
        &self.metrics
    }

    /// Full label set for a metric.
    pub fn label_set(&self, metric: &str) -> LabelSet {
        LabelSet::for_metric(&self.config.metric_prefix, metric, &self.config.labels)
    }

    /// Cached high-water mark for a metric, without consulting the backend.
    pub async fn last_written(&self, metric: &str) -> Option<OffsetDateTime> {
        self.last_times.lock().await.get(metric).copied()
    }

    /// Report a [`Sample`].
    pub async fn report_sample(&self, sample: &Sample) -> Result<ReportOutcome> {
        self.report_metric(&sample.metric, sample.timestamp, sample.value)
            .await
    }

    /// Write one sample unless an equal or newer one was already written.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidTimestamp`] for the zero timestamp
    /// - [`SyncError::TimestampTooFarFuture`] for timestamps more than an hour ahead
    /// - [`SyncError::AmbiguousSeries`] if the cold-cache lookup matches several series
    /// - [`SyncError::BackendQueryFailed`] if the cold-cache lookup fails
    /// - [`SyncError::WriteFailed`] if the write fails; the mark is not advanced
    ///
    /// Validation errors are returned before any network call.
    pub async fn report_metric(
        &self,
        metric: &str,
        ts: OffsetDateTime,
        value: f64,
    ) -> Result<ReportOutcome> {
        let result = self.try_report(metric, ts, value).await;
        self.metrics.record(match &result {
            Ok(ReportOutcome::Written) => WriteOutcome::Success,
            Ok(ReportOutcome::Skipped) => WriteOutcome::Skipped,
            Err(_) => WriteOutcome::Error,
        });
        result
    }

    async fn try_report(
        &self,
        metric: &str,
        ts: OffsetDateTime,
        value: f64,
    ) -> Result<ReportOutcome> {
        if is_zero_time(ts) {
            return Err(SyncError::InvalidTimestamp {
                metric: metric.to_string(),
            });
        }
        let now = OffsetDateTime::now_utc();
        if ts > now + MAX_FUTURE_SKEW {
            return Err(SyncError::TimestampTooFarFuture {
                metric: metric.to_string(),
                timestamp: ts,
            });
        }

        let mut last_times = self.last_times.lock().await;
        let last = match last_times.get(metric) {
            Some(last) => Some(*last),
            None => {
                let found = self.lookup_last_time(metric, now).await?;
                if let Some(last) = found {
                    last_times.insert(metric.to_string(), last);
                }
                found
            }
        };

        if let Some(last) = last
            && ts <= last
        {
            debug!(metric, %ts, %last, "skipping value with timestamp before last reported");
            return Ok(ReportOutcome::Skipped);
        }

        let request = self.write_request(metric, ts, value);
        if self.config.dry_run {
            info!(metric, %ts, value, ?request, "dry run, skipping write");
        } else {
            with_timeout(self.config.write_timeout, self.backend.write(&request))
                .await
                .map_err(|source| SyncError::WriteFailed {
                    metric: metric.to_string(),
                    source,
                })?;
            debug!(metric, %ts, value, "sample written");
        }

        last_times.insert(metric.to_string(), ts);
        Ok(ReportOutcome::Written)
    }

    /// Ask the backend for the newest sample of `metric`.
    ///
    /// `Ok(None)` means the series does not exist within the lookback window.
    async fn lookup_last_time(
        &self,
        metric: &str,
        now: OffsetDateTime,
    ) -> Result<Option<OffsetDateTime>> {
        let query = format!("timestamp({})", self.label_set(metric).selector());
        let query_failed = |source| SyncError::BackendQueryFailed {
            metric: metric.to_string(),
            source,
        };

        let result = with_timeout(
            self.config.query_timeout,
            self.backend
                .instant_query(&query, now, self.config.lookback),
        )
        .await
        .map_err(query_failed)?;

        match result.as_slice() {
            [] => {
                warn!(%query, "no time series matched query");
                Ok(None)
            }
            [sample] => {
                let last = seconds_to_time(sample.value).map_err(query_failed)?;
                debug!(metric, value = sample.value, %last, "last time");
                Ok(Some(last))
            }
            many => Err(SyncError::AmbiguousSeries {
                metric: metric.to_string(),
                query,
                count: many.len(),
            }),
        }
    }

    fn write_request(&self, metric: &str, ts: OffsetDateTime, value: f64) -> WriteRequest {
        let millis = ts.unix_timestamp_nanos() / 1_000_000;
        WriteRequest {
            timeseries: vec![proto::TimeSeries {
                labels: self.label_set(metric).to_proto(),
                samples: vec![proto::Sample {
                    value,
                    timestamp: millis as i64,
                }],
            }],
        }
    }
}

/// Run a backend call with a budget.
async fn with_timeout<T>(
    budget: Duration,
    call: impl Future<Output = std::result::Result<T, BackendError>>,
) -> std::result::Result<T, BackendError> {
    tokio::time::timeout(budget, call)
        .await
        .map_err(|_| BackendError::Timeout(budget))?
}

/// Convert float seconds since the epoch (as returned by `timestamp()`).
fn seconds_to_time(secs: f64) -> std::result::Result<OffsetDateTime, BackendError> {
    if !secs.is_finite() {
        return Err(BackendError::InvalidResponse(format!(
            "timestamp value {secs} is not finite"
        )));
    }
    let nanos = (secs * 1e9).round() as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|e| BackendError::InvalidResponse(format!("timestamp value {secs}: {e}")))
}
