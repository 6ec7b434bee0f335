use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// EmberDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid data, typically decoding errors, checksum mismatches, or other
    /// on-disk corruption. The engine does not attempt to repair or skip
    /// corrupted regions; the error surfaces to the caller.
    InvalidData(String),
    /// Invalid use of an API, e.g. building an empty SST or indexing a block
    /// entry out of range.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// A write was attempted on a read-only structure (frozen skip list,
    /// finished SST builder, etc.).
    ReadOnly,
    /// A write transaction conflicted with a different writer and lost. The
    /// transaction was aborted and must be retried.
    Serialization,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::Serialization => write!(f, "serialization failure, retry transaction"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)) };
}

/// An EmberDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
