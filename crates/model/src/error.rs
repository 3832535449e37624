//! Model Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A model error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// No bundle in the channel is free of incoming replacement edges.
    #[display("no channel head found")]
    NoChannelHead,
    /// More than one bundle in the channel is free of incoming replacement edges.
    #[display("multiple candidate channel heads found: {}", _0.join(", "))]
    MultipleChannelHeads(#[error(not(source))] Vec<String>),
    /// Walking `replaces` from the head revisited a bundle.
    #[display("cycle detected: {bundle} replaces {replaces}, which was already visited")]
    Cycle { bundle: String, replaces: String },
    /// A property value could not be decoded for its declared type.
    #[display("invalid property value for type '{kind}': {value}")]
    InvalidProperty { kind: String, value: String },
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        // A graph is either well-formed or it isn't.
        false
    }
}
