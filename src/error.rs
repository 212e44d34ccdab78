use std::sync::Arc;

/// Engine-wide error type.
///
/// A point lookup that finds nothing is not an error: reads return
/// `Ok(None)`. Errors are cheap to clone so a background failure can be
/// recorded once and handed back to every subsequent writer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Checksum mismatch, malformed encoding, or inconsistent metadata.
    #[error("corruption: {0}")]
    Corruption(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    /// The database is shutting down; foreground work was cancelled.
    #[error("shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}
