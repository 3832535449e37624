//! Registry Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use opcat_model::error::{Error as GraphError, ErrorKind as GraphErrorKind};

/// A registry error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// The database predates migrations this build requires.
    #[display("registry schema is at version {current}, expected {latest}; run `opcat registry migrate`")]
    OutdatedSchema { current: i64, latest: i64 },
    /// Package, channel or bundle absent from the store.
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    #[display("bundle already exists: {_0}")]
    AlreadyExists(#[error(not(source))] String),
    /// An alpha feature was used while alpha features are disabled.
    #[display("unsupported feature: {_0} requires alpha features to be enabled")]
    UnsupportedFeature(#[error(not(source))] &'static str),
    #[display("invalid package manifest: {_0}")]
    InvalidManifest(#[error(not(source))] String),
    /// A bundle names a predecessor that was never added (and never deprecated).
    #[display("{bundle} replaces {replaces}, which is not in the registry")]
    ReplacesNotFound { bundle: String, replaces: String },
    /// Structural problem in a channel graph (head, cycle).
    #[display("invalid channel graph: {_0}")]
    Graph(GraphErrorKind),
    /// One or more channels of a package failed to load; the others were kept.
    #[display("package {package}: {} channel(s) failed to load: {}", errors.len(), errors.join("; "))]
    InvalidChannels { package: String, errors: Vec<String> },
    /// Deprecating the default channel's head would leave the package without
    /// a default channel.
    #[display(
        "cannot deprecate {bundle}: it is the head of the default channel of {package}; deprecate every channel head to remove the package (also required: [{}])",
        also_required.join(", ")
    )]
    RemovingDefaultChannelDuringDeprecation {
        bundle: String,
        package: String,
        also_required: Vec<String>,
    },
    /// Every failure of a permissive batch, in input order.
    #[display("{} item(s) failed: {}", _0.len(), _0.join("; "))]
    Batch(#[error(not(source))] Vec<String>),
    /// Stored data could not be decoded.
    #[display("invalid registry data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Convert a graph error into a registry error, preserving the model
    /// crate's `Exn` frame as a child in its own error tree.
    #[track_caller]
    pub fn graph(err: GraphError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Graph(inner))
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
