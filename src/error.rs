//! Error types for headwater

use crate::model::Labels;

/// Result type alias for headwater operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for headwater
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Sample reuses the previous timestamp with a different value
    #[error("sample with repeated timestamp but different value for series {labels}; last value: {last_value}, incoming value: {incoming_value}")]
    DuplicateTimestamp {
        labels: Labels,
        last_value: f64,
        incoming_value: f64,
    },
    /// Sample timestamp is older than the last accepted sample
    #[error("sample timestamp out of order for series {labels}; last timestamp: {last_timestamp}, incoming timestamp: {incoming_timestamp}")]
    OutOfOrderTimestamp {
        labels: Labels,
        last_timestamp: i64,
        incoming_timestamp: i64,
    },
    /// Malformed label set
    #[error("invalid label set: {0}")]
    InvalidLabels(String),
    /// Malformed label matcher
    #[error("invalid label matcher: {0}")]
    InvalidMatcher(String),
    /// Tenant exceeded its series limit
    #[error("per-tenant series limit of {limit} exceeded")]
    TooManySeriesPerTenant { limit: usize },
    /// Metric exceeded its series limit within a tenant
    #[error("per-metric series limit of {limit} exceeded for metric {metric:?}")]
    TooManySeriesPerMetric { metric: String, limit: usize },
    /// Request context carries no tenant identity
    #[error("no tenant id in request context")]
    MissingTenant,
    /// Ingester is shutting down or stopped
    #[error("ingester is not running")]
    NotRunning,
    /// Request was cancelled by the caller
    #[error("request cancelled")]
    Cancelled,
    /// Chunk payload could not be decoded
    #[error("chunk encoding error: {0}")]
    Encoding(String),
    /// Chunk store rejected a flush
    #[error("chunk store error: {0}")]
    Store(String),
    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP-equivalent status code, for the transport layer to map responses
    /// without matching on error text.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::DuplicateTimestamp { .. }
            | Error::OutOfOrderTimestamp { .. }
            | Error::InvalidLabels(_)
            | Error::InvalidMatcher(_) => 400,
            Error::MissingTenant => 401,
            Error::TooManySeriesPerTenant { .. } | Error::TooManySeriesPerMetric { .. } => 429,
            Error::Cancelled => 499,
            Error::NotRunning => 503,
            Error::Encoding(_) | Error::Store(_) | Error::Internal(_) => 500,
        }
    }

    /// Per-sample errors that are recorded but do not abort sibling samples
    /// in the same write batch.
    pub fn is_bad_sample(&self) -> bool {
        matches!(
            self,
            Error::DuplicateTimestamp { .. }
                | Error::OutOfOrderTimestamp { .. }
                | Error::InvalidLabels(_)
        )
    }

    /// Admission-limit errors that abort the rest of the write batch.
    pub fn is_admission_limit(&self) -> bool {
        matches!(
            self,
            Error::TooManySeriesPerTenant { .. } | Error::TooManySeriesPerMetric { .. }
        )
    }
}
