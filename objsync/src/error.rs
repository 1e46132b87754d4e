//! Error types for the migration engine

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Comprehensive error type for sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Object is intentionally bypassed; not a failure
    #[error("object skipped: {reason}")]
    SkipObject { reason: String },

    /// Permanent per-object failure; never retried
    #[error("non-retriable failure: {message}")]
    NonRetriable { message: String },

    /// The requested identifier does not exist in the storage
    #[error("object not found: {identifier}")]
    ObjectNotFound { identifier: String },

    /// Plugin configuration errors (abort the run before any work starts)
    #[error("configuration error in plugin '{plugin}': {message}")]
    Config { plugin: String, message: String },

    /// Status-ledger errors
    #[error("ledger error: {0}")]
    Db(String),

    /// Storage plugin errors
    #[error("storage error at '{identifier}': {message}")]
    Storage { identifier: String, message: String },

    /// Post-copy verification errors
    #[error("verification failed: {message}")]
    Verification { message: String },

    /// A bounded pool queue rejected a non-blocking submission
    #[error("work queue full in pool '{pool}'")]
    QueueFull { pool: String },

    /// Submission or control call on a stopped pool
    #[error("pool '{pool}' is shut down")]
    PoolShutDown { pool: String },

    /// Operation was cancelled
    #[error("operation was cancelled")]
    Cancelled,

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors with context
    #[error("error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl SyncError {
    /// Create a skip-object outcome with a reason
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::SkipObject {
            reason: reason.into(),
        }
    }

    /// Create a non-retriable failure
    pub fn non_retriable(message: impl Into<String>) -> Self {
        Self::NonRetriable {
            message: message.into(),
        }
    }

    /// Create an object-not-found error
    pub fn not_found(identifier: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            identifier: identifier.into(),
        }
    }

    /// Create a configuration error naming the plugin that failed
    pub fn config(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a storage error for an identifier
    pub fn storage(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            identifier: identifier.into(),
            message: message.into(),
        }
    }

    /// Create a verification error
    pub fn verification(message: impl Into<String>) -> Self {
        Self::Verification {
            message: message.into(),
        }
    }

    /// Whether a failed sync attempt may be re-queued for another attempt.
    ///
    /// Skips are not failures, non-retriable errors are terminal, and
    /// cancellation/shutdown ends the attempt without consuming a retry.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Self::SkipObject { .. }
                | Self::NonRetriable { .. }
                | Self::Config { .. }
                | Self::Cancelled
                | Self::PoolShutDown { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(SyncError::storage("a", "timeout").is_retriable());
        assert!(SyncError::verification("md5 mismatch").is_retriable());
        assert!(SyncError::Db("insert failed".to_string()).is_retriable());

        assert!(!SyncError::skip("up to date").is_retriable());
        assert!(!SyncError::non_retriable("bad acl").is_retriable());
        assert!(!SyncError::Cancelled.is_retriable());
        assert!(!SyncError::config("source", "missing root").is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::config("encryption-filter", "key not set");
        assert_eq!(
            err.to_string(),
            "configuration error in plugin 'encryption-filter': key not set"
        );

        let err = SyncError::not_found("dir1/file3");
        assert_eq!(err.to_string(), "object not found: dir1/file3");
    }
}
