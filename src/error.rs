//! Error types for ctp-core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using ctp-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error taxonomy driving retry and propagation policy.
///
/// - `Transient`: retry with backoff.
/// - `Domain`: record and skip; never re-queued.
/// - `DataIntegrity`: demote the offending rows and alert.
/// - `Fatal`: halt the run after an orderly shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Transient,
    Domain,
    DataIntegrity,
    Fatal,
}

/// Errors that can occur during pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Storage lock contention or disk pressure; retriable
    #[error("storage busy: {0}")]
    StorageBusy(String),

    /// Database corruption; fatal to the run
    #[error("storage corruption: {0}")]
    Corruption(String),

    /// Constraint violation surfaced from the store
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Queue broker error
    #[error("queue error: {0}")]
    Queue(String),

    /// Circuit breaker is open for a target
    #[error("circuit open for {target}")]
    CircuitOpen { target: String },

    /// Rate limiter rejected the request
    #[error("rate limited: {class}")]
    RateLimited { class: String },

    /// Concurrency cap rejected the request
    #[error("concurrency limit reached for {class}")]
    Throttled { class: String },

    /// Timeout during an external call
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// LLM API error (network, provider-side throttling)
    #[error("llm error: {0}")]
    Llm(String),

    /// Transient filesystem or network I/O failure
    #[error("io error: {0}")]
    Io(String),

    /// Extractor output could not be interpreted
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A POI reference did not resolve within the run
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// Inserting evidence would close a cycle
    #[error("evidence cycle detected at relationship {relationship_id}")]
    EvidenceCycle { relationship_id: i64 },

    /// Configuration invariant violated
    #[error("configuration error: {0}")]
    Config(String),

    /// A probed dependency is unavailable
    #[error("dependency {name} unavailable: {reason}")]
    DependencyUnavailable { name: String, reason: String },

    /// A reserved job's visibility window expired before ack
    #[error("visibility timeout expired for job {job_id}")]
    VisibilityExpired { job_id: u64 },

    /// Retry budget exhausted for a job
    #[error("attempts exhausted for job {job_id}")]
    AttemptsExhausted { job_id: u64 },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Graph sink transport error; retriable
    #[error("graph sink error: {0}")]
    Sink(String),

    /// Graph sink rejected the batch as schema-invalid
    #[error("graph sink schema violation: {0}")]
    SinkSchema(String),

    /// Run stopped by operator
    #[error("run stopped by operator")]
    Stopped,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error into the retry/propagation taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StorageBusy(_)
            | Self::Queue(_)
            | Self::CircuitOpen { .. }
            | Self::RateLimited { .. }
            | Self::Throttled { .. }
            | Self::Timeout { .. }
            | Self::Llm(_)
            | Self::Io(_)
            | Self::DependencyUnavailable { .. }
            | Self::Sink(_)
            | Self::VisibilityExpired { .. } => ErrorKind::Transient,

            Self::MalformedPayload(_)
            | Self::UnresolvedReference(_)
            | Self::EvidenceCycle { .. }
            | Self::Serialization(_)
            | Self::SinkSchema(_) => ErrorKind::Domain,

            Self::Constraint(_) => ErrorKind::DataIntegrity,

            Self::Storage(_)
            | Self::Corruption(_)
            | Self::Config(_)
            | Self::AttemptsExhausted { .. }
            | Self::Stopped
            | Self::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// True when the retry policy should re-deliver the failed job.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Create a circuit-open error.
    pub fn circuit_open(target: impl Into<String>) -> Self {
        Self::CircuitOpen {
            target: target.into(),
        }
    }

    /// Create a rate-limited error.
    pub fn rate_limited(class: impl Into<String>) -> Self {
        Self::RateLimited {
            class: class.into(),
        }
    }

    /// Create a throttled error.
    pub fn throttled(class: impl Into<String>) -> Self {
        Self::Throttled {
            class: class.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a dependency-unavailable error.
    pub fn dependency(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DependencyUnavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &e {
            rusqlite::Error::SqliteFailure(inner, _) => match inner.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    Self::StorageBusy(e.to_string())
                }
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    Self::Corruption(e.to_string())
                }
                ErrorCode::ConstraintViolation => Self::Constraint(e.to_string()),
                ErrorCode::DiskFull => Self::StorageBusy(e.to_string()),
                _ => Self::Storage(e.to_string()),
            },
            _ => Self::Storage(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(Error::rate_limited("file-analysis").is_retryable());
        assert!(Error::circuit_open("llm").is_retryable());
        assert!(Error::timeout(150_000).is_retryable());
        assert!(Error::StorageBusy("locked".into()).is_retryable());
    }

    #[test]
    fn domain_errors_are_not_retryable() {
        assert_eq!(
            Error::MalformedPayload("bad json".into()).kind(),
            ErrorKind::Domain
        );
        assert_eq!(
            Error::EvidenceCycle { relationship_id: 7 }.kind(),
            ErrorKind::Domain
        );
        assert!(!Error::MalformedPayload("bad".into()).is_retryable());
    }

    #[test]
    fn corruption_is_fatal() {
        assert_eq!(Error::Corruption("page 3".into()).kind(), ErrorKind::Fatal);
        assert_eq!(Error::Config("weights".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn constraint_violations_are_data_integrity() {
        assert_eq!(
            Error::Constraint("UNIQUE failed".into()).kind(),
            ErrorKind::DataIntegrity
        );
    }
}
