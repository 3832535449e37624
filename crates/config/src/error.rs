//! Configuration Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// An explicitly requested configuration file does not exist.
    #[display("configuration file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    #[display("unsupported configuration format (expected toml, yaml or json): {}", _0.display())]
    UnsupportedFormat(#[error(not(source))] PathBuf),
    /// The merged layers could not be deserialized.
    #[display("invalid configuration: {_0}")]
    Extract(#[error(not(source))] String),
    /// A value deserialized but is out of range.
    #[display("invalid configuration value for {key}: {reason}")]
    Invalid { key: &'static str, reason: &'static str },
}

impl ErrorKind {
    /// Configuration errors need the file or environment fixed first.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
