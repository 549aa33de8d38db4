//! Prometheus remote-write (v1) protobuf messages.
//!
//! Only the fields this crate sends are declared. Field tags match
//! `prometheus/prompb/types.proto` and `remote.proto`.

use prost::Message;

use crate::error::BackendError;

/// A remote-write request.
#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

/// One series and its samples.
#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    /// Labels, sorted by name.
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

impl WriteRequest {
    /// Encode and snappy-compress the request as the wire body.
    pub fn to_snappy(&self) -> Result<Vec<u8>, BackendError> {
        let raw = self.encode_to_vec();
        snap::raw::Encoder::new()
            .compress_vec(&raw)
            .map_err(|e| BackendError::Encode(e.to_string()))
    }

    /// Decode a snappy-compressed body.
    pub fn from_snappy(body: &[u8]) -> Result<Self, BackendError> {
        let raw = snap::raw::Decoder::new()
            .decompress_vec(body)
            .map_err(|e| BackendError::Encode(e.to_string()))?;
        Self::decode(raw.as_slice()).map_err(|e| BackendError::Encode(e.to_string()))
    }

    /// Total number of samples across all series.
    pub fn sample_count(&self) -> usize {
        self.timeseries.iter().map(|ts| ts.samples.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snappy_body_decodes() {
        let request = WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![
                    Label {
                        name: "__name__".to_string(),
                        value: "aranet4_co2_ppm".to_string(),
                    },
                    Label {
                        name: "job".to_string(),
                        value: "aranet4".to_string(),
                    },
                ],
                samples: vec![Sample {
                    value: 612.0,
                    timestamp: 1_735_732_800_000,
                }],
            }],
        };

        let body = request.to_snappy().unwrap();
        let decoded = WriteRequest::from_snappy(&body).unwrap();
        assert_eq!(decoded.timeseries[0].labels[0].value, "aranet4_co2_ppm");
        assert_eq!(decoded.sample_count(), 1);
    }

    #[test]
    fn test_from_snappy_rejects_garbage() {
        assert!(WriteRequest::from_snappy(b"not snappy at all").is_err());
    }
}
