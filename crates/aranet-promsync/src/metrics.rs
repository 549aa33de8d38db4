//! Write outcome accounting.

use prometheus::{IntCounterVec, Opts, Registry};

use crate::error::Result;

/// Outcome of a single [`crate::Syncer::report_metric`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOutcome {
    /// The sample was written (or would have been, in dry-run mode).
    Success,
    /// The sample was not newer than the high-water mark.
    Skipped,
    /// The call failed.
    Error,
}

impl WriteOutcome {
    /// Label value used for the `status` label.
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOutcome::Success => "success",
            WriteOutcome::Skipped => "skipped",
            WriteOutcome::Error => "error",
        }
    }
}

/// Counter of write attempts partitioned by outcome.
#[derive(Debug, Clone)]
pub struct WriteMetrics {
    writes: IntCounterVec,
}

impl WriteMetrics {
    /// Create the counter `<prefix>prometheus_writes_total{status}`.
    pub fn new(prefix: &str) -> Result<Self> {
        let writes = IntCounterVec::new(
            Opts::new(
                format!("{prefix}prometheus_writes_total"),
                "Total number of metric write attempts by status",
            ),
            &["status"],
        )?;
        Ok(Self { writes })
    }

    /// Register the counter with a registry.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.writes.clone()))?;
        Ok(())
    }

    /// Count one outcome.
    pub fn record(&self, outcome: WriteOutcome) {
        self.writes.with_label_values(&[outcome.as_str()]).inc();
    }

    /// Current count for an outcome.
    pub fn count(&self, outcome: WriteOutcome) -> u64 {
        self.writes.with_label_values(&[outcome.as_str()]).get()
    }
}
