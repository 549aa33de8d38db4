//! Periodic Aranet4 history collector for Prometheus.
//!
//! This crate provides a collector that:
//! - Reads the stored history of an Aranet4 on a schedule
//! - Drops sentinel records and sorts the rest by time
//! - Writes each sample to Prometheus through [`aranet_promsync::Syncer`],
//!   never duplicating a sample or writing one out of order
//! - Takes the pairing passkey from the terminal or the status page,
//!   whichever answers first
//!
//! # Web Endpoints
//!
//! - `GET /` - Status page (with the passkey form while pairing)
//! - `POST /` - Submit a passkey
//! - `POST /refresh` - Refresh now
//! - `GET /metrics` - Collector metrics
//! - `GET /api/health` - Health check
//! - `GET /api/status` - Collector status
//!
//! # Configuration
//!
//! The collector reads configuration from `~/.config/aranet/promsync.toml`:
//!
//! ```toml
//! [prometheus]
//! url = "http://localhost:9090/"
//! prefix = "aranet4_"
//!
//! [device]
//! address = "Aranet4 17C3C"
//! ```
//!
//! See [`config`] for every option.

pub mod collector;
pub mod config;
pub mod mock;
pub mod passkey;
pub mod source;
pub mod state;
pub mod validation;
pub mod web;

pub use collector::{
    Collector, CollectorError, CollectorMetrics, RefreshError, RefreshOutcome, RefreshStatus,
};
pub use config::{
    CollectorConfig, Config, ConfigError, DeviceConfig, PairingConfig, PrometheusConfig,
    ServerConfig, SourceKind, ValidationError,
};
pub use mock::MockSource;
pub use passkey::{
    PasskeyError, PasskeyMediator, PasskeyRequest, PasskeyState, parse_passkey,
    spawn_terminal_prompt,
};
pub use source::{Acquisition, AcquisitionError, ReadingSource, ServiceSource};
pub use state::{AppState, CollectorState};
pub use validation::{ValidationIssue, validate_readings};
