/// Errors raised by the storage engines.
///
/// # Examples
///
/// ```rust
/// use tally_storage::error::StorageError;
///
/// let err = StorageError::InvalidMetric {
///     id: String::new(),
///     reason: "metric id must not be empty",
/// };
/// assert!(err.to_string().contains("invalid metric"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The metric failed validation before any write happened.
    #[error("Storage: invalid metric {id:?}: {reason}")]
    InvalidMetric { id: String, reason: &'static str },

    /// Reading or writing the snapshot file failed.
    #[error("Storage: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A metric could not be encoded for the snapshot file.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A line of the snapshot file could not be decoded during restore.
    #[error("Storage: cannot restore {path} at line {line}: {source}")]
    Restore {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// An underlying database error.
    #[error("Storage: database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// A stored row does not describe a valid metric.
    #[error("Storage: corrupt row for {id:?}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
