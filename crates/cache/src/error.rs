//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use opcat_model::error::{Error as GraphError, ErrorKind as GraphErrorKind};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Package, channel or bundle absent from the cache.
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// Access denied on the cache or source directory.
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// A name cannot be used as a cache path component.
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// The cache directory matches no backend's on-disk layout (or more than one).
    #[display("cache directory has unexpected contents: {}", _0.display())]
    UnexpectedContents(#[error(not(source))] PathBuf),
    /// The embedded store failed.
    #[display("backend error: {_0}")]
    Backend(#[error(not(source))] String),
    /// The embedded store cannot be opened as a store at all.
    #[display("cache store is corrupt: {_0}")]
    Corrupt(#[error(not(source))] String),
    /// Nothing stored the package index yet.
    #[display("package index missing")]
    IndexMissing,
    /// A stored value could not be encoded or decoded.
    #[display("encoding error: {_0}")]
    Encoding(#[error(not(source))] &'static str),
    /// The source catalog could not be parsed.
    #[display("invalid source catalog: {_0}")]
    InvalidSource(#[error(not(source))] String),
    /// A package of the source catalog is not a valid graph.
    #[display("invalid package {package}: {reason}")]
    InvalidPackage { package: String, reason: String },
    /// Structural problem in a channel graph (head, cycle).
    #[display("invalid channel graph: {_0}")]
    Graph(GraphErrorKind),
    /// The stored digest does not describe the current source and cache
    /// contents. Rebuilding fixes this.
    #[display("cache digest mismatch: stored {stored}, computed {computed}")]
    DigestMismatch { stored: String, computed: String },
    /// Queried before the package index was loaded.
    #[display("cache not loaded")]
    NotLoaded,
    /// The backend was used before `open` or after `close`.
    #[display("cache backend is not open")]
    NotOpen,
    /// A build was cancelled from outside.
    #[display("cache build cancelled")]
    Cancelled,
    /// A build worker panicked or was aborted.
    #[display("cache build worker failed")]
    Worker,
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}
impl ErrorKind {
    /// Convert a graph error into a cache error, preserving the model
    /// crate's `Exn` frame as a child in its own error tree.
    #[track_caller]
    pub fn graph(err: GraphError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Graph(inner))
    }

    pub(crate) fn io(err: IoError, path: impl Into<PathBuf>) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.into().display().to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.into()),
            _ => Self::Io(err),
        }
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Backend(_) | Self::Worker)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::IndexMissing)
    }

    /// Returns `true` for errors a rebuild of the cache resolves.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::DigestMismatch { .. } | Self::IndexMissing | Self::Corrupt(_) | Self::Encoding(_))
    }
}
