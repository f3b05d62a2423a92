use thiserror::Error;

/// Failure taxonomy shared by every storage operation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Malformed input, rejected before anything is written.
    #[error("invalid input: {0}")]
    Validation(String),
    /// The backing store could not be opened.
    #[error("failed to open storage: {0}")]
    Open(String),
    /// Schema absent or not at the expected version. Fatal at startup.
    #[error("schema error: {0}")]
    Schema(String),
    /// One or more write batches failed. Retrying the whole call is safe.
    #[error("write failed for {failed} of {total} batches: {cause}")]
    Write {
        failed: usize,
        total: usize,
        cause: String,
    },
    #[error("query failed: {0}")]
    Query(String),
    /// A query dimension was requested while the feature backing it is off.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}
