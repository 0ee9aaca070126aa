use thiserror::Error;

/// Result type for coordination operations
pub type CoordResult<T> = Result<T, CoordError>;

/// Infrastructure errors raised by stores, the queue provider and configuration
#[derive(Error, Debug, Clone)]
pub enum CoordError {
    /// A store call failed in a way that may succeed later
    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Queue provider error: {0}")]
    Provider(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordError {
    /// Whether the call site should retry with backoff before giving up
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStore(_) | Self::Provider(_))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Processing outcome errors reported by an item processor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// One item failed; it is dead-lettered and the batch continues
    #[error("Permanent item error: {0}")]
    Permanent(String),

    /// Failure before any per-item outcome was known
    #[error("Batch-fatal error: {0}")]
    BatchFatal(String),
}

impl ProcessError {
    /// Create a permanent per-item error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Create a batch-fatal error
    pub fn batch_fatal(msg: impl Into<String>) -> Self {
        Self::BatchFatal(msg.into())
    }

    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, Self::BatchFatal(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Permanent(msg) | Self::BatchFatal(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for CoordError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Serialization(err.to_string())
            }
            sqlx::Error::Configuration(_) => Self::Config(err.to_string()),
            _ => Self::TransientStore(err.to_string()),
        }
    }
}
