use std::io;
use thiserror::Error;

/// Error types for blob store operations
#[derive(Debug, Error)]
pub enum BlobError {
    /// Key source shorter than the factory's policy minimum
    #[error("Insufficient key source: got {got} bytes, at least {min} required")]
    InsufficientKeySource { got: usize, min: usize },

    /// Key string that is empty, malformed or carries an unknown algorithm tag
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A different blob is already committed under this id
    #[error("A colliding blob id has been found: {0}")]
    BidCollision(String),

    #[error("A blob with given id was not found: {0}")]
    BidNotFound(String),

    /// Malformed blob payload (bad type tag, truncated record, oversized field)
    #[error("Format error: {0}")]
    Format(String),

    /// Stored bytes do not match their validation method
    #[error("Validation error: {0}")]
    Validation(String),

    /// Backend failures that are not plain I/O errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    /// Backend I/O errors, passed through unchanged
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

impl BlobError {
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Recover a `BlobError` that crossed an `io::Read`/`io::Write` boundary.
    pub fn from_io(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<BlobError>()) {
            return Self::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<BlobError>()) {
            Some(Ok(blob_err)) => *blob_err,
            _ => Self::storage("wrapped error lost"),
        }
    }
}

impl From<BlobError> for io::Error {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::Io(e) => e,
            BlobError::BidNotFound(_) => io::Error::new(io::ErrorKind::NotFound, err),
            BlobError::Format(_) | BlobError::Validation(_) => {
                io::Error::new(io::ErrorKind::InvalidData, err)
            }
            other => io::Error::other(other),
        }
    }
}
