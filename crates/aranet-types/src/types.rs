//! Core types for Aranet sensor data.

use time::OffsetDateTime;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The instant that stands for "no timestamp".
///
/// Devices report unset or unreadable clocks as zero, which decodes to the
/// Unix epoch. Nothing legitimately measured by an Aranet sensor carries it.
pub const ZERO_TIME: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;

/// Returns `true` if `ts` is the zero instant.
///
/// # Examples
///
/// ```
/// use aranet_types::{ZERO_TIME, is_zero_time};
/// use time::OffsetDateTime;
///
/// assert!(is_zero_time(ZERO_TIME));
/// assert!(!is_zero_time(OffsetDateTime::now_utc()));
/// ```
#[must_use]
pub fn is_zero_time(ts: OffsetDateTime) -> bool {
    ts == ZERO_TIME
}

/// A raw record read from a device.
///
/// Values are kept exactly as reported. Sentinel values (zero timestamp,
/// non-positive CO2 or pressure) are legal here and are filtered out later by
/// the collector's validator.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// When the measurement was taken.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// CO2 concentration in ppm.
    pub co2: i32,
    /// Temperature in degrees Celsius.
    pub temperature: f64,
    /// Atmospheric pressure in hPa.
    pub pressure: f64,
    /// Relative humidity percentage.
    pub humidity: f64,
    /// Battery level percentage, if the source reports one.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub battery: Option<u8>,
}

impl Default for Reading {
    fn default() -> Self {
        Self {
            timestamp: ZERO_TIME,
            co2: 0,
            temperature: 0.0,
            pressure: 0.0,
            humidity: 0.0,
            battery: None,
        }
    }
}

impl Reading {
    /// Metric name for CO2 concentration.
    pub const CO2: &'static str = "co2_ppm";
    /// Metric name for relative humidity.
    pub const HUMIDITY: &'static str = "humidity_percent";
    /// Metric name for atmospheric pressure.
    pub const PRESSURE: &'static str = "pressure_hpa";
    /// Metric name for temperature.
    pub const TEMPERATURE: &'static str = "temperature_celsius";
    /// Metric name for battery level.
    pub const BATTERY: &'static str = "battery_level_percent";

    /// Create a builder for constructing a `Reading`.
    pub fn builder() -> ReadingBuilder {
        ReadingBuilder::default()
    }

    /// Expand the record into one sample per measured quantity.
    ///
    /// The order is fixed (CO2, humidity, pressure, temperature). Battery is
    /// not included; it is only reported from the latest reading.
    pub fn samples(&self) -> Vec<Sample> {
        vec![
            Sample::new(Self::CO2, self.timestamp, f64::from(self.co2)),
            Sample::new(Self::HUMIDITY, self.timestamp, self.humidity),
            Sample::new(Self::PRESSURE, self.timestamp, self.pressure),
            Sample::new(Self::TEMPERATURE, self.timestamp, self.temperature),
        ]
    }

    /// The battery sample for this reading, if a battery level is known.
    pub fn battery_sample(&self) -> Option<Sample> {
        self.battery
            .map(|level| Sample::new(Self::BATTERY, self.timestamp, f64::from(level)))
    }
}

/// Builder for [`Reading`].
#[derive(Debug, Default)]
#[must_use]
pub struct ReadingBuilder {
    reading: Reading,
}

impl ReadingBuilder {
    /// Set the timestamp.
    pub fn timestamp(mut self, timestamp: OffsetDateTime) -> Self {
        self.reading.timestamp = timestamp;
        self
    }

    /// Set CO2 concentration.
    pub fn co2(mut self, co2: i32) -> Self {
        self.reading.co2 = co2;
        self
    }

    /// Set temperature.
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.reading.temperature = temperature;
        self
    }

    /// Set pressure.
    pub fn pressure(mut self, pressure: f64) -> Self {
        self.reading.pressure = pressure;
        self
    }

    /// Set humidity.
    pub fn humidity(mut self, humidity: f64) -> Self {
        self.reading.humidity = humidity;
        self
    }

    /// Set battery level.
    pub fn battery(mut self, battery: u8) -> Self {
        self.reading.battery = Some(battery);
        self
    }

    /// Build the reading.
    pub fn build(self) -> Reading {
        self.reading
    }
}

/// A single timestamped value for one metric.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sample {
    /// Metric name without the configured prefix (e.g. `co2_ppm`).
    pub metric: String,
    /// Sample time.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Sample value.
    pub value: f64,
}

impl Sample {
    /// Create a new sample.
    pub fn new(metric: impl Into<String>, timestamp: OffsetDateTime, value: f64) -> Self {
        Self {
            metric: metric.into(),
            timestamp,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::datetime;

    #[test]
    fn test_default_reading_has_zero_time() {
        let reading = Reading::default();
        assert!(is_zero_time(reading.timestamp));
        assert_eq!(reading.battery, None);
    }

    #[test]
    fn test_samples_order_and_values() {
        let ts = datetime!(2025-03-01 08:30 UTC);
        let reading = Reading::builder()
            .timestamp(ts)
            .co2(800)
            .temperature(22.5)
            .pressure(1013.2)
            .humidity(45.0)
            .build();

        let samples = reading.samples();
        let names: Vec<_> = samples.iter().map(|s| s.metric.as_str()).collect();
        assert_eq!(
            names,
            ["co2_ppm", "humidity_percent", "pressure_hpa", "temperature_celsius"]
        );
        assert!(samples.iter().all(|s| s.timestamp == ts));
        assert_eq!(samples[0].value, 800.0);
        assert_eq!(samples[2].value, 1013.2);
    }

    #[test]
    fn test_battery_sample() {
        let ts = datetime!(2025-03-01 08:30 UTC);
        let without = Reading::builder().timestamp(ts).build();
        assert!(without.battery_sample().is_none());

        let with = Reading::builder().timestamp(ts).battery(87).build();
        let sample = with.battery_sample().unwrap();
        assert_eq!(sample.metric, "battery_level_percent");
        assert_eq!(sample.value, 87.0);
        assert_eq!(sample.timestamp, ts);
    }

    #[test]
    fn test_reading_serde() {
        let reading = Reading::builder()
            .timestamp(datetime!(2025-03-01 08:30 UTC))
            .co2(640)
            .pressure(1001.0)
            .build();

        let json = serde_json::to_string(&reading).unwrap();
        assert!(json.contains("2025-03-01T08:30:00Z"));
        assert!(!json.contains("battery"));

        let parsed: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reading);
    }

    proptest! {
        #[test]
        fn prop_samples_share_reading_timestamp(secs in 1i64..4_000_000_000, co2 in -10i32..5000) {
            let ts = OffsetDateTime::from_unix_timestamp(secs).unwrap();
            let reading = Reading::builder().timestamp(ts).co2(co2).build();
            for sample in reading.samples() {
                prop_assert_eq!(sample.timestamp, ts);
            }
        }
    }
}
