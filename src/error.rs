//! CLI Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

/// Which part of opcat a command failed in.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("cache error")]
    Cache,
    #[display("registry error")]
    Registry,
    #[display("query error")]
    Query,
    #[display("query server error")]
    Serve,
    /// An input file is missing or does not decode.
    #[display("cannot read {}", _0.display())]
    Input(#[error(not(source))] PathBuf),
    /// The command cannot run with the given flags and configuration.
    #[display("{_0}")]
    Usage(#[error(not(source))] &'static str),
}
