//! Backend abstraction.
//!
//! The sync engine needs exactly two things from a time-series backend: an
//! instant query to discover the last written sample of a series, and a
//! remote write. [`Backend`] captures those so the engine can run against the
//! real Prometheus client or an in-memory fake.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::BackendError;
use crate::proto::WriteRequest;

/// One element of an instant-vector query result.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSample {
    /// Labels of the matched series.
    pub metric: BTreeMap<String, String>,
    /// Evaluation timestamp, in seconds since the epoch.
    pub timestamp: f64,
    /// Sample value.
    pub value: f64,
}

/// Operations the sync engine performs against a time-series backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Evaluate `query` at instant `at`, looking back at most `lookback`.
    ///
    /// Must fail with [`BackendError::UnexpectedResultType`] if the result is
    /// not an instant vector.
    async fn instant_query(
        &self,
        query: &str,
        at: OffsetDateTime,
        lookback: Duration,
    ) -> Result<Vec<VectorSample>, BackendError>;

    /// Submit a remote-write request.
    async fn write(&self, request: &WriteRequest) -> Result<(), BackendError>;
}
