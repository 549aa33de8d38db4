//! Structural checks on raw device records.
//!
//! Devices report unreadable sensors with sentinel values: a zero timestamp, or
//! a non-positive CO2 or pressure value. Such records are dropped before they
//! reach the sync engine.
//!
//! The surviving records are returned sorted by timestamp. The sync engine
//! keeps one high-water mark per metric and skips anything not newer, so an
//! out-of-order record would be silently lost.
//!
//! # Example
//!
//! ```
//! use aranet_collector::validation::validate_readings;
//! use aranet_types::Reading;
//! use time::macros::datetime;
//!
//! let readings = vec![
//!     Reading::builder()
//!         .timestamp(datetime!(2025-01-01 12:05 UTC))
//!         .co2(610)
//!         .pressure(1012.0)
//!         .build(),
//!     Reading::builder()
//!         .timestamp(datetime!(2025-01-01 12:00 UTC))
//!         .co2(-1)
//!         .pressure(1012.0)
//!         .build(),
//! ];
//!
//! let valid = validate_readings(readings);
//! assert_eq!(valid.len(), 1);
//! assert_eq!(valid[0].co2, 610);
//! ```

use std::fmt;

use tracing::warn;

use aranet_types::{Reading, is_zero_time};

/// Why a record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationIssue {
    /// The record has no timestamp.
    ZeroTimestamp,
    /// CO2 concentration is zero or negative.
    NonPositiveCo2,
    /// Pressure is zero or negative.
    NonPositivePressure,
}

impl ValidationIssue {
    /// The first issue found in `reading`, if any.
    pub fn check(reading: &Reading) -> Option<Self> {
        if is_zero_time(reading.timestamp) {
            Some(Self::ZeroTimestamp)
        } else if reading.co2 <= 0 {
            Some(Self::NonPositiveCo2)
        } else if reading.pressure <= 0.0 || reading.pressure.is_nan() {
            Some(Self::NonPositivePressure)
        } else {
            None
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroTimestamp => write!(f, "unexpected time value"),
            Self::NonPositiveCo2 => write!(f, "unexpected CO2 value"),
            Self::NonPositivePressure => write!(f, "unexpected pressure value"),
        }
    }
}

/// Drop invalid records and sort the rest by timestamp.
///
/// The sort is stable, so records sharing a timestamp keep their input order.
pub fn validate_readings(readings: Vec<Reading>) -> Vec<Reading> {
    let mut valid: Vec<Reading> = readings
        .into_iter()
        .filter(|reading| match ValidationIssue::check(reading) {
            Some(issue) => {
                warn!(%issue, ?reading, "skipping record");
                false
            }
            None => true,
        })
        .collect();
    valid.sort_by_key(|reading| reading.timestamp);
    valid
}
