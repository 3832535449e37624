//! Cache path construction.
//!
//! The plain backend turns package, channel and bundle names into file
//! names. Names come from the source catalog, so each one must be a single
//! path component that cannot escape the cache root.

use crate::error::{ErrorKind, Result};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Validates that `name` is exactly one normal path component.
///
/// # Examples
///
/// ```
/// use opcat_cache::validate_segment;
/// assert!(validate_segment("etcd.v0.9.2").is_ok());
/// assert!(validate_segment("..").is_err());
/// assert!(validate_segment("a/b").is_err());
/// assert!(validate_segment("a\0b").is_err());
/// ```
pub fn validate_segment(name: &str) -> Result<&OsStr> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        // Null bytes pass through Path::components() on Unix but cause
        // truncation in C-based syscalls.
        (Some(Component::Normal(s)), None) if !s.as_encoded_bytes().contains(&0) && s == name => Ok(s),
        _ => exn::bail!(ErrorKind::InvalidPath(PathBuf::from(name))),
    }
}

/// Relative location of a bundle file: `<package>/<channel>/<bundle>.json`.
pub(crate) fn bundle_file(package: &str, channel: &str, bundle: &str) -> Result<PathBuf> {
    let mut path = PathBuf::new();
    path.push(validate_segment(package)?);
    path.push(validate_segment(channel)?);
    path.push(format!("{}.json", validate_segment(bundle)?.display()));
    Ok(path)
}
