use std::io;

use thiserror::Error;

/// Errors raised while writing or reading a table file.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Checksum mismatch or a malformed block, footer or entry.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The caller broke a writer contract (unsorted keys, empty table).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, TableError>;

pub(crate) fn corruption(msg: impl Into<String>) -> TableError {
    TableError::Corruption(msg.into())
}
