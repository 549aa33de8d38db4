//! Error types for aranet-promsync.
//!
//! [`SyncError`] is what callers of [`crate::Syncer::report_metric`] see.
//! [`BackendError`] describes transport and protocol failures of a single
//! backend call and is always wrapped by a `SyncError` variant that names the
//! metric involved.
//!
//! None of these errors is fatal to a running collector except
//! [`SyncError::InvalidConfig`], which is only produced at construction time.

use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;

/// Errors returned by the sync engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The sync configuration is unusable (missing or malformed endpoint).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The sample has the zero timestamp.
    #[error("cannot report metric {metric:?} with zero timestamp")]
    InvalidTimestamp {
        /// Metric name (without prefix).
        metric: String,
    },

    /// The sample is more than the allowed skew ahead of the wall clock.
    #[error(
        "timestamp {timestamp} for metric {metric:?} is too far in the future (more than 1 hour ahead of now)"
    )]
    TimestampTooFarFuture {
        /// Metric name (without prefix).
        metric: String,
        /// The offending timestamp.
        timestamp: OffsetDateTime,
    },

    /// The last-written lookup matched more than one series.
    #[error("multiple time series ({count}) matched query {query} for metric {metric:?}")]
    AmbiguousSeries {
        /// Metric name (without prefix).
        metric: String,
        /// The query that was evaluated.
        query: String,
        /// Number of series returned.
        count: usize,
    },

    /// The last-written lookup failed.
    #[error("querying metric {metric:?}: {source}")]
    BackendQueryFailed {
        /// Metric name (without prefix).
        metric: String,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// The remote write failed. The high-water mark was not advanced.
    #[error("sending sample for metric {metric:?}: {source}")]
    WriteFailed {
        /// Metric name (without prefix).
        metric: String,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// Metric registration failed.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Failures of a single backend call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// HTTP transport error.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend answered with a non-success HTTP status.
    #[error("backend returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body (possibly truncated).
        body: String,
    },

    /// The query API reported an error in its JSON envelope.
    #[error("query API error ({error_type}): {message}")]
    Api {
        /// Prometheus `errorType`.
        error_type: String,
        /// Prometheus `error`.
        message: String,
    },

    /// The query returned something other than an instant vector.
    #[error("query returned non-vector result type {0:?}")]
    UnexpectedResultType(String),

    /// The response could not be interpreted.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The write request could not be encoded.
    #[error("encoding write request: {0}")]
    Encode(String),

    /// The call did not finish within its budget.
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_metric() {
        let err = SyncError::InvalidTimestamp {
            metric: "co2_ppm".to_string(),
        };
        assert!(err.to_string().contains("zero timestamp"));
        assert!(err.to_string().contains("co2_ppm"));

        let err = SyncError::AmbiguousSeries {
            metric: "co2_ppm".to_string(),
            query: "timestamp({__name__=\"aranet4_co2_ppm\"})".to_string(),
            count: 2,
        };
        assert!(err.to_string().contains("multiple time series"));
    }

    #[test]
    fn test_backend_error_is_source() {
        use std::error::Error as _;

        let err = SyncError::WriteFailed {
            metric: "pressure_hpa".to_string(),
            source: BackendError::Status {
                status: 500,
                body: "boom".to_string(),
            },
        };
        let source = err.source().expect("has source");
        assert!(source.to_string().contains("HTTP 500"));
    }
}
