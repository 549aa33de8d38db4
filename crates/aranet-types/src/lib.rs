//! Platform-agnostic types for syncing Aranet sensor data.
//!
//! This crate holds the data model shared by the sync engine
//! (`aranet-promsync`) and the collector service (`aranet-collector`):
//!
//! - [`Reading`]: one raw record as delivered by a device, possibly invalid
//! - [`Sample`]: one `(metric, timestamp, value)` point bound for the backend
//! - Zero-instant helpers used to recognise unset timestamps
//!
//! # Example
//!
//! ```
//! use aranet_types::{Reading, is_zero_time};
//! use time::macros::datetime;
//!
//! let reading = Reading::builder()
//!     .timestamp(datetime!(2025-01-01 12:00 UTC))
//!     .co2(612)
//!     .temperature(21.4)
//!     .pressure(1009.8)
//!     .humidity(41.0)
//!     .build();
//!
//! assert!(!is_zero_time(reading.timestamp));
//! assert_eq!(reading.samples().len(), 4);
//! ```

pub mod types;

pub use types::{Reading, ReadingBuilder, Sample, ZERO_TIME, is_zero_time};
