//! Duplicate-free Prometheus remote write for Aranet sensor history.
//!
//! Aranet devices keep a rolling on-device history, so every collection cycle
//! downloads mostly the same records again. This crate forwards each sample to
//! a Prometheus-compatible backend exactly once.
//!
//! # Features
//!
//! - **High-water mark per metric**: only samples strictly newer than the last
//!   written one are sent
//! - **Restart safety**: on first use the mark is recovered from the backend
//!   with a `timestamp(...)` instant query, no local state needed
//! - **Remote write v1**: protobuf + snappy, one sample per request
//! - **Dry run**: log what would be written while still tracking the mark
//! - **Outcome counters**: `<prefix>prometheus_writes_total{status}`
//!
//! # Quick Start
//!
//! ```no_run
//! use aranet_promsync::{SyncConfig, Syncer};
//! use time::OffsetDateTime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::new("http://localhost:9090/")
//!         .metric_prefix("aranet4_")
//!         .label("job", "aranet4")
//!         .label("instance", "living-room");
//!     let syncer = Syncer::new(config)?;
//!
//!     let outcome = syncer
//!         .report_metric("co2_ppm", OffsetDateTime::now_utc(), 612.0)
//!         .await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod labels;
pub mod metrics;
pub mod mock;
pub mod proto;
pub mod remote;
pub mod syncer;

pub use backend::{Backend, VectorSample};
pub use config::SyncConfig;
pub use error::{BackendError, Result, SyncError};
pub use labels::LabelSet;
pub use metrics::{WriteMetrics, WriteOutcome};
pub use mock::MockBackend;
pub use remote::PrometheusBackend;
pub use syncer::{MAX_FUTURE_SKEW, ReportOutcome, Syncer};
