use uuid::Uuid;

/// Result type alias for memory and skill operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the concurrent memory and skill substrate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(Uuid),

    #[error("Not found by name: {0}")]
    NotFoundByName(String),

    #[error("Version conflict: expected {expected}, stored version is {actual}")]
    VersionConflict { expected: u32, actual: u32 },

    #[error("Name conflict: an active skill named '{0}' already exists")]
    NameConflict(String),

    #[error("Timed out waiting for {what} after {waited_ms}ms")]
    Timeout { what: String, waited_ms: u64 },

    #[error("Shared backend unhealthy: {0}")]
    Unhealthy(String),

    #[error("Corrupt payload: {0}")]
    Corruption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stale process lock on {resource} could not be reclaimed")]
    LockStale { resource: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience constructor for lock and I/O deadline expiry.
    #[must_use]
    pub fn timeout(what: impl Into<String>, waited: std::time::Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Check if this error is retryable (transient; retry with backoff).
    ///
    /// Callers own the retry policy; the core never retries writes itself.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } | Error::Storage(_) | Error::Io(_) | Error::LockStale { .. } => {
                true
            }
            // The caller should refetch and retry with the fresh version,
            // which is a different loop than blind backoff, but the failure
            // itself is transient.
            Error::VersionConflict { .. } => true,
            Error::Validation(_)
            | Error::NotFound(_)
            | Error::NotFoundByName(_)
            | Error::NameConflict(_)
            | Error::Unhealthy(_)
            | Error::Corruption(_)
            | Error::Serialization(_)
            | Error::Configuration(_)
            | Error::Internal(_) => false,
        }
    }

    /// Check if the operation still committed against the durable store.
    ///
    /// `Unhealthy` is informational: the write landed durably and only the
    /// shared mirror was skipped.
    #[must_use]
    pub fn is_informational(&self) -> bool {
        matches!(self, Error::Unhealthy(_))
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_constructor() {
        let err = Error::timeout("write lock on episodic", Duration::from_millis(1500));
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("write lock on episodic"));
        assert!(msg.contains("1500ms"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Storage("disk".into()).is_retryable());
        assert!(
            Error::VersionConflict {
                expected: 1,
                actual: 2
            }
            .is_retryable()
        );
        assert!(!Error::Validation("bad field".into()).is_retryable());
        assert!(!Error::NameConflict("login".into()).is_retryable());
        assert!(!Error::Corruption("bad marker".into()).is_retryable());
    }

    #[test]
    fn test_unhealthy_is_informational() {
        assert!(Error::Unhealthy("redis down".into()).is_informational());
        assert!(!Error::Storage("x".into()).is_informational());
    }
}
