//! The refresh loop.
//!
//! One cycle acquires readings, validates them and reports every sample
//! through the [`Syncer`]. Cycles run one at a time; between them the loop
//! sleeps until one interval after the last success, or for a short backoff
//! when that moment has already passed.
//!
//! A failed cycle is logged, counted and retried on the next tick. Nothing
//! in a cycle terminates the process.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{Gauge, HistogramOpts, HistogramVec, Opts};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use aranet_promsync::{ReportOutcome, SyncError, Syncer};
use aranet_types::{Reading, Sample};

use crate::config::CollectorConfig;
use crate::source::{AcquisitionError, ReadingSource};
use crate::state::AppState;
use crate::validation::validate_readings;

/// Refresh cycle status, used as the `status` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    Success,
    Error,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::Success => "success",
            RefreshStatus::Error => "error",
        }
    }
}

/// Errors that fail a refresh cycle.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// Reading from the device failed.
    #[error("reading data: {0}")]
    AcquisitionFailed(#[from] AcquisitionError),

    /// Reporting a sample failed.
    #[error("reporting {metric} at {timestamp}: {source}")]
    Report {
        metric: String,
        timestamp: OffsetDateTime,
        #[source]
        source: SyncError,
    },

    /// The cycle exceeded its budget.
    #[error("refresh cycle timed out after {0:?}")]
    Timeout(Duration),
}

/// Result of one refresh cycle.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub status: RefreshStatus,
    pub latency: Duration,
    /// Newest record processed, if the cycle succeeded and processed any.
    pub last_reported: Option<OffsetDateTime>,
    /// Why the cycle failed.
    pub error: Option<RefreshError>,
}

/// Collector setup errors.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("registering metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Refresh cycle metrics.
#[derive(Debug, Clone)]
pub struct CollectorMetrics {
    latencies: HistogramVec,
    last_success: Gauge,
}

/// Five exponential buckets from 1 s to 120 s.
fn latency_buckets() -> prometheus::Result<Vec<f64>> {
    const MIN: f64 = 1.0;
    const MAX: f64 = 120.0;
    const COUNT: usize = 5;
    let factor = (MAX / MIN).powf(1.0 / (COUNT - 1) as f64);
    prometheus::exponential_buckets(MIN, factor, COUNT)
}

impl CollectorMetrics {
    /// Create `<prefix>refresh_latencies_seconds{status}` and
    /// `<prefix>last_success_time_seconds`.
    pub fn new(prefix: &str) -> prometheus::Result<Self> {
        let latencies = HistogramVec::new(
            HistogramOpts::new(
                format!("{prefix}refresh_latencies_seconds"),
                "Latencies of refresh attempts.",
            )
            .buckets(latency_buckets()?),
            &["status"],
        )?;
        let last_success = Gauge::with_opts(Opts::new(
            format!("{prefix}last_success_time_seconds"),
            "The last time the collector successfully refreshed data.",
        ))?;
        Ok(Self {
            latencies,
            last_success,
        })
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.latencies.clone()))?;
        registry.register(Box::new(self.last_success.clone()))?;
        Ok(())
    }

    fn observe(&self, status: RefreshStatus, latency: Duration) {
        self.latencies
            .with_label_values(&[status.as_str()])
            .observe(latency.as_secs_f64());
    }
}

/// Drives acquisition and sync on a schedule.
pub struct Collector {
    state: Arc<AppState>,
    syncer: Arc<Syncer>,
    source: Arc<dyn ReadingSource>,
    metrics: CollectorMetrics,
    settings: CollectorConfig,
}

impl Collector {
    /// Create a collector and register its metrics, and the syncer's, with
    /// the state's registry.
    pub fn new(
        state: Arc<AppState>,
        syncer: Arc<Syncer>,
        source: Arc<dyn ReadingSource>,
    ) -> Result<Self, CollectorError> {
        let metrics = CollectorMetrics::new(&syncer.config().metric_prefix)?;
        metrics.register(&state.registry)?;
        syncer.metrics().register(&state.registry)?;
        let settings = state.config.collector.clone();
        Ok(Self {
            state,
            syncer,
            source,
            metrics,
            settings,
        })
    }

    /// The shared state.
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run one refresh cycle and record its outcome.
    pub async fn refresh(&self) -> RefreshOutcome {
        let started = Instant::now();
        let budget = self.settings.cycle_timeout();
        let result = match tokio::time::timeout(budget, self.run_cycle()).await {
            Ok(result) => result,
            Err(_) => Err(RefreshError::Timeout(budget)),
        };
        let latency = started.elapsed();

        match result {
            Ok(last_reported) => {
                let now = OffsetDateTime::now_utc();
                self.state.collector.record_success(now, last_reported);
                self.metrics
                    .last_success
                    .set(now.unix_timestamp_nanos() as f64 / 1e9);
                self.metrics.observe(RefreshStatus::Success, latency);
                info!(?latency, ?last_reported, "refresh succeeded");
                RefreshOutcome {
                    status: RefreshStatus::Success,
                    latency,
                    last_reported,
                    error: None,
                }
            }
            Err(e) => {
                self.state.collector.record_failure(e.to_string());
                self.metrics.observe(RefreshStatus::Error, latency);
                error!(error = %e, ?latency, "failed to refresh");
                RefreshOutcome {
                    status: RefreshStatus::Error,
                    latency,
                    last_reported: None,
                    error: Some(e),
                }
            }
        }
    }

    async fn run_cycle(&self) -> Result<Option<OffsetDateTime>, RefreshError> {
        let acquire_timeout = self.settings.acquire_timeout();
        let acquisition = tokio::time::timeout(acquire_timeout, self.source.acquire())
            .await
            .map_err(|_| AcquisitionError::Timeout(acquire_timeout))??;
        info!(num_records = acquisition.history.len(), "read data");

        if let Some(sample) = acquisition.latest.as_ref().and_then(Reading::battery_sample) {
            self.report(&sample).await?;
        }

        if acquisition.history.is_empty() {
            warn!("no history read");
            return Ok(None);
        }

        let readings = validate_readings(acquisition.history);
        let (mut written, mut skipped) = (0usize, 0usize);
        let mut last_reported = None;
        for reading in &readings {
            debug!(?reading, "reporting record");
            for sample in reading.samples() {
                match self.report(&sample).await? {
                    ReportOutcome::Written => written += 1,
                    ReportOutcome::Skipped => skipped += 1,
                }
            }
            last_reported = Some(reading.timestamp);
        }
        info!(records = readings.len(), written, skipped, "history synced");
        Ok(last_reported)
    }

    async fn report(&self, sample: &Sample) -> Result<ReportOutcome, RefreshError> {
        self.syncer
            .report_sample(sample)
            .await
            .map_err(|source| RefreshError::Report {
                metric: sample.metric.clone(),
                timestamp: sample.timestamp,
                source,
            })
    }

    /// How long to wait before the next cycle, as of `now`.
    ///
    /// One interval after the last success, or the retry backoff if that is
    /// not in the future (including when nothing has succeeded yet).
    pub fn next_wait(&self, now: OffsetDateTime) -> Duration {
        let backoff = self.settings.retry_backoff();
        let Some(last_success) = self.state.collector.last_success() else {
            return backoff;
        };
        let wait = last_success + self.settings.interval() - now;
        match Duration::try_from(wait) {
            Ok(wait) if !wait.is_zero() => wait,
            _ => backoff,
        }
    }

    /// Run cycles until the stop signal.
    ///
    /// Each cycle runs in its own task so a panic fails that cycle only.
    pub async fn run(self: Arc<Self>) {
        let mut stop = self.state.collector.subscribe_stop();
        self.state.collector.set_running(true);
        info!(source = %self.source.describe(), interval = ?self.settings.interval(), "collector started");

        while !*stop.borrow() {
            let started = Instant::now();
            let collector = Arc::clone(&self);
            if let Err(e) = tokio::spawn(async move { collector.refresh().await }).await {
                error!(error = %e, "refresh cycle panicked");
                self.metrics.observe(RefreshStatus::Error, started.elapsed());
                self.state.collector.record_failure(format!("refresh cycle panicked: {e}"));
            }

            let wait = self.next_wait(OffsetDateTime::now_utc());
            info!(wait_for = ?wait, "waiting for next interval");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.state.collector.refresh_requested() => {
                    info!("refresh requested");
                }
                result = stop.changed() => {
                    if result.is_err() {
                        break;
                    }
                }
            }
        }

        self.state.collector.set_running(false);
        info!("collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mock::MockSource;
    use aranet_promsync::{MockBackend, SyncConfig, WriteOutcome};
    use aranet_types::ZERO_TIME;
    use prometheus::Encoder;

    struct Fixture {
        collector: Arc<Collector>,
        source: Arc<MockSource>,
        backend: Arc<MockBackend>,
        syncer: Arc<Syncer>,
    }

    fn fixture(source: MockSource) -> Fixture {
        let mut config = Config::default();
        config.device.address = "AA:BB".to_string();
        let state = AppState::new(config);
        let backend = Arc::new(MockBackend::new());
        let sync_config = SyncConfig::new("http://localhost:9090")
            .metric_prefix("aranet4_")
            .label("job", "aranet4");
        let syncer = Arc::new(Syncer::with_backend(sync_config, backend.clone()).unwrap());
        let source = Arc::new(source);
        let collector =
            Arc::new(Collector::new(state, syncer.clone(), source.clone()).unwrap());
        Fixture {
            collector,
            source,
            backend,
            syncer,
        }
    }

    fn minutes_ago(minutes: u64) -> OffsetDateTime {
        OffsetDateTime::now_utc().replace_nanosecond(0).unwrap()
            - Duration::from_secs(minutes * 60)
    }

    fn reading(timestamp: OffsetDateTime, co2: i32) -> Reading {
        Reading::builder()
            .timestamp(timestamp)
            .co2(co2)
            .temperature(21.0)
            .pressure(1013.0)
            .humidity(40.0)
            .build()
    }

    #[test]
    fn test_latency_buckets() {
        let buckets = latency_buckets().unwrap();
        assert_eq!(buckets.len(), 5);
        assert!((buckets[0] - 1.0).abs() < 1e-9);
        assert!((buckets[4] - 120.0).abs() < 1e-6);
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_refresh_reports_history_in_order() {
        let t1 = minutes_ago(10);
        let t2 = minutes_ago(5);
        let latest = Reading {
            battery: Some(85),
            ..reading(t2, 620)
        };
        let source = MockSource::new()
            .with_latest(latest)
            .with_history(vec![reading(t2, 620), reading(t1, 600)]);
        let f = fixture(source);

        let outcome = f.collector.refresh().await;
        assert_eq!(outcome.status, RefreshStatus::Success);
        assert_eq!(outcome.last_reported, Some(t2));
        assert!(outcome.error.is_none());

        // Battery plus four metrics per record.
        assert_eq!(f.backend.write_count(), 9);
        assert_eq!(f.backend.written_values("aranet4_co2_ppm"), vec![600.0, 620.0]);
        assert_eq!(
            f.backend.written_values("aranet4_battery_level_percent"),
            vec![85.0]
        );

        let state = &f.collector.state().collector;
        assert_eq!(state.last_reported(), Some(t2));
        assert!(state.last_success().is_some());
    }

    #[tokio::test]
    async fn test_second_refresh_skips_everything() {
        let t1 = minutes_ago(10);
        let f = fixture(MockSource::new().with_history(vec![reading(t1, 600)]));

        f.collector.refresh().await;
        let outcome = f.collector.refresh().await;
        assert_eq!(outcome.status, RefreshStatus::Success);
        assert_eq!(f.backend.write_count(), 4);
        assert_eq!(f.syncer.metrics().count(WriteOutcome::Skipped), 4);
    }

    #[tokio::test]
    async fn test_invalid_records_dropped() {
        let t1 = minutes_ago(10);
        let t2 = minutes_ago(5);
        let f = fixture(MockSource::new().with_history(vec![
            reading(ZERO_TIME, 500),
            reading(t1, -5),
            Reading {
                pressure: 0.0,
                ..reading(t1, 400)
            },
            reading(t2, 410),
        ]));

        let outcome = f.collector.refresh().await;
        assert_eq!(outcome.status, RefreshStatus::Success);
        assert_eq!(f.backend.written_values("aranet4_co2_ppm"), vec![410.0]);
    }

    #[tokio::test]
    async fn test_empty_history_is_success() {
        let f = fixture(MockSource::new());
        let outcome = f.collector.refresh().await;
        assert_eq!(outcome.status, RefreshStatus::Success);
        assert_eq!(outcome.last_reported, None);
        assert_eq!(f.collector.state().collector.last_reported(), None);
        assert!(f.collector.state().collector.last_success().is_some());
    }

    #[tokio::test]
    async fn test_acquisition_failure_is_recorded() {
        let f = fixture(MockSource::new());
        f.source.set_should_fail(true, Some("device not found")).await;

        let outcome = f.collector.refresh().await;
        assert_eq!(outcome.status, RefreshStatus::Error);
        assert!(matches!(
            outcome.error,
            Some(RefreshError::AcquisitionFailed(_))
        ));
        let state = &f.collector.state().collector;
        assert_eq!(state.last_success(), None);
        assert!(state.last_error().unwrap().contains("device not found"));
    }

    #[tokio::test]
    async fn test_write_failure_aborts_cycle() {
        let t1 = minutes_ago(10);
        let t2 = minutes_ago(5);
        let f = fixture(MockSource::new().with_history(vec![reading(t1, 600), reading(t2, 610)]));
        f.backend.set_fail_writes(true);

        let outcome = f.collector.refresh().await;
        assert_eq!(outcome.status, RefreshStatus::Error);
        assert!(matches!(
            outcome.error,
            Some(RefreshError::Report { ref metric, .. }) if metric == "co2_ppm"
        ));
        // Nothing after the failed sample was attempted.
        assert_eq!(f.syncer.metrics().count(WriteOutcome::Error), 1);
        assert_eq!(f.syncer.last_written("co2_ppm").await, None);

        // The next cycle picks up from the same place.
        f.backend.set_fail_writes(false);
        let outcome = f.collector.refresh().await;
        assert_eq!(outcome.status, RefreshStatus::Success);
        assert_eq!(f.backend.written_values("aranet4_co2_ppm"), vec![600.0, 610.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_acquisition_times_out() {
        let f = fixture(MockSource::new());
        f.source.set_latency(Duration::from_secs(3600));

        let outcome = f.collector.refresh().await;
        assert!(matches!(
            outcome.error,
            Some(RefreshError::AcquisitionFailed(AcquisitionError::Timeout(d))) if d == Duration::from_secs(120)
        ));
        assert!(outcome.latency >= Duration::from_secs(120));
        assert!(outcome.latency < Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_metrics_registered() {
        let f = fixture(MockSource::new().with_history(vec![reading(minutes_ago(1), 500)]));
        f.collector.refresh().await;

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&f.collector.state().registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains(r#"aranet4_refresh_latencies_seconds_count{status="success"} 1"#));
        assert!(text.contains(r#"aranet4_prometheus_writes_total{status="success"} 4"#));
        assert!(text.contains("aranet4_last_success_time_seconds"));
    }

    #[tokio::test]
    async fn test_next_wait() {
        let f = fixture(MockSource::new());
        let now = OffsetDateTime::now_utc();
        assert_eq!(f.collector.next_wait(now), Duration::from_secs(1));

        f.collector.state().collector.record_success(now, None);
        let wait = f.collector.next_wait(now + Duration::from_secs(600));
        assert_eq!(wait, Duration::from_secs(3000));

        // Overran the interval: retry after the backoff.
        let late = now + Duration::from_secs(3600 + 5);
        assert_eq!(f.collector.next_wait(late), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_failures_until_stopped() {
        let f = fixture(MockSource::new());
        f.source.set_should_fail(true, None).await;

        let handle = tokio::spawn(Arc::clone(&f.collector).run());
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(f.collector.state().collector.is_running());
        assert!(f.source.acquire_count() >= 3);

        f.collector.state().collector.signal_stop();
        handle.await.unwrap();
        assert!(!f.collector.state().collector.is_running());
    }

    struct PanickingSource;

    #[async_trait::async_trait]
    impl ReadingSource for PanickingSource {
        async fn acquire(&self) -> Result<crate::source::Acquisition, AcquisitionError> {
            panic!("device layer fault");
        }

        fn describe(&self) -> String {
            "panicking source".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_cycle_counts_as_error() {
        let mut config = Config::default();
        config.device.address = "AA:BB".to_string();
        let state = AppState::new(config);
        let syncer = Arc::new(
            Syncer::with_backend(
                SyncConfig::new("http://localhost:9090").metric_prefix("aranet4_"),
                Arc::new(MockBackend::new()),
            )
            .unwrap(),
        );
        let collector =
            Arc::new(Collector::new(state.clone(), syncer, Arc::new(PanickingSource)).unwrap());

        let handle = tokio::spawn(Arc::clone(&collector).run());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        state.collector.signal_stop();
        handle.await.unwrap();

        assert!(state.collector.failure_count() >= 2);
        assert!(state.collector.last_error().unwrap().contains("panicked"));
        assert_eq!(state.collector.last_success(), None);

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&state.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let count = format!(
            r#"aranet4_refresh_latencies_seconds_count{{status="error"}} {}"#,
            state.collector.failure_count()
        );
        assert!(text.contains(&count), "{text}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_wakes_wait() {
        let f = fixture(MockSource::new());

        let handle = tokio::spawn(Arc::clone(&f.collector).run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.source.acquire_count(), 1, "next cycle is an hour away");

        f.collector.state().collector.trigger_refresh();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.source.acquire_count(), 2);

        f.collector.state().collector.signal_stop();
        handle.await.unwrap();
    }
}
