use std::io;
use std::sync::Arc;

use sstable::TableError;
use thiserror::Error;
use wal::WalError;

/// Status taxonomy of the engine.
///
/// `Clone` so that one failure can be handed to every writer of a group
/// commit and kept as the latched background error.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A named file or store does not exist. `get` reports a missing key as
    /// `Ok(None)`, not with this variant.
    #[error("not found: {0}")]
    NotFound(String),

    /// Checksum or format mismatch.
    #[error("corruption: {0}")]
    Corruption(String),

    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    /// Bad options or a request the engine cannot honour.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The database is shutting down.
    #[error("database is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<TableError> for Error {
    fn from(e: TableError) -> Self {
        match e {
            TableError::Io(e) => Error::from(e),
            TableError::Corruption(msg) => Error::Corruption(msg),
            TableError::InvalidArgument(msg) => Error::InvalidArgument(msg),
        }
    }
}

impl From<WalError> for Error {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Io(e) => Error::from(e),
            WalError::Corrupt { offset } => {
                Error::Corruption(format!("damaged log record at offset {}", offset))
            }
        }
    }
}

impl Error {
    /// Converts a table error the caller only borrows, such as an
    /// iterator's retained status.
    pub(crate) fn from_table_ref(e: &TableError) -> Self {
        match e {
            TableError::Io(io) => Error::Io(Arc::new(io::Error::new(io.kind(), io.to_string()))),
            TableError::Corruption(msg) => Error::Corruption(msg.clone()),
            TableError::InvalidArgument(msg) => Error::InvalidArgument(msg.clone()),
        }
    }
}
