//! In-memory backend for testing.
//!
//! [`MockBackend`] implements [`Backend`] without any network access. It
//! answers `timestamp(<selector>)` queries from a table of known series and
//! records every write it receives, so tests can assert exactly what would
//! have been sent to Prometheus.
//!
//! # Features
//!
//! - **Failure injection**: make queries or writes fail
//! - **Latency simulation**: delay every call, e.g. to exercise timeouts
//! - **Write-through**: written samples become visible to later queries, so
//!   a fresh [`crate::Syncer`] on the same backend behaves like a restarted
//!   process

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::backend::{Backend, VectorSample};
use crate::error::BackendError;
use crate::labels::METRIC_NAME_LABEL;
use crate::proto::WriteRequest;

/// A fake Prometheus.
#[derive(Debug, Default)]
pub struct MockBackend {
    /// Latest sample timestamps (seconds) per full metric name. More than one
    /// entry makes the lookup ambiguous.
    series: Mutex<HashMap<String, Vec<f64>>>,
    writes: Mutex<Vec<WriteRequest>>,
    queries: Mutex<Vec<String>>,
    query_count: AtomicU32,
    fail_queries: AtomicBool,
    fail_writes: AtomicBool,
    latency_ms: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockBackend {
    /// Create an empty backend with no series.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a series for `full_name` whose newest sample is at `timestamp`
    /// seconds. Calling this twice for the same name creates two series.
    pub fn with_series(self, full_name: &str, timestamp: f64) -> Self {
        lock(&self.series)
            .entry(full_name.to_string())
            .or_default()
            .push(timestamp);
        self
    }

    /// Make every query fail.
    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of queries received.
    pub fn query_count(&self) -> u32 {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Query strings received, in order.
    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        lock(&self.writes).len()
    }

    /// All successful write requests, in order.
    pub fn writes(&self) -> Vec<WriteRequest> {
        lock(&self.writes).clone()
    }

    /// Values written for a full metric name, in order.
    pub fn written_values(&self, full_name: &str) -> Vec<f64> {
        lock(&self.writes)
            .iter()
            .flat_map(|request| request.timeseries.iter())
            .filter(|series| {
                series
                    .labels
                    .iter()
                    .any(|l| l.name == METRIC_NAME_LABEL && l.value == full_name)
            })
            .flat_map(|series| series.samples.iter().map(|s| s.value))
            .collect()
    }

    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// Extract the `__name__` matcher value from a selector query.
fn metric_name_in(query: &str) -> Option<&str> {
    let start = query.find("__name__=\"")? + "__name__=\"".len();
    let len = query[start..].find('"')?;
    Some(&query[start..start + len])
}

#[async_trait]
impl Backend for MockBackend {
    async fn instant_query(
        &self,
        query: &str,
        at: OffsetDateTime,
        _lookback: Duration,
    ) -> Result<Vec<VectorSample>, BackendError> {
        self.simulate_latency().await;
        self.query_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.queries).push(query.to_string());

        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                status: 500,
                body: "mock query failure".to_string(),
            });
        }

        let name = metric_name_in(query).ok_or_else(|| BackendError::Api {
            error_type: "bad_data".to_string(),
            message: format!("no metric name in query {query:?}"),
        })?;
        let eval_time = at.unix_timestamp_nanos() as f64 / 1e9;
        let samples = lock(&self.series)
            .get(name)
            .map(|timestamps| {
                timestamps
                    .iter()
                    .enumerate()
                    .map(|(i, ts)| VectorSample {
                        metric: BTreeMap::from([("series".to_string(), i.to_string())]),
                        timestamp: eval_time,
                        value: *ts,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(samples)
    }

    async fn write(&self, request: &WriteRequest) -> Result<(), BackendError> {
        self.simulate_latency().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                status: 503,
                body: "mock write failure".to_string(),
            });
        }

        let mut series = lock(&self.series);
        for ts in &request.timeseries {
            let Some(name) = ts.labels.iter().find(|l| l.name == METRIC_NAME_LABEL) else {
                continue;
            };
            let Some(newest) = ts.samples.iter().map(|s| s.timestamp).max() else {
                continue;
            };
            let secs = newest as f64 / 1000.0;
            let entry = series.entry(name.value.clone()).or_default();
            match entry.first_mut() {
                Some(existing) if *existing < secs => *existing = secs,
                Some(_) => {}
                None => entry.push(secs),
            }
        }
        drop(series);

        lock(&self.writes).push(request.clone());
        Ok(())
    }
}
