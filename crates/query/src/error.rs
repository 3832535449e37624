//! Query Error Types
//!
//! Every backend raises its own failures into these kinds so that a transport
//! layer only has to tell "not found" apart from everything else.

use derive_more::{Display, Error};

/// A query error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for query operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The package, channel or bundle asked for does not exist.
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The store behind the query failed.
    #[display("query backend error")]
    Backend,
    /// The store returned data that does not decode.
    #[display("invalid catalog data: {_0}")]
    InvalidData(#[error(not(source))] String),
}

impl ErrorKind {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend)
    }
}
