//! Cache backend trait and implementations.
//!
//! A backend stores one package index and one bundle record per
//! `(package, channel, bundle)` under a cache directory, next to a digest of
//! the source catalog and cache contents it was built from. Two layouts
//! exist and a cache directory holds exactly one of them:
//!
//! - [`CompactBackend`]: an embedded `redb` store under `store/`.
//! - [`PlainBackend`]: one JSON file per bundle under `cache/` plus
//!   `packages.json`.
//!
//! Both write the digest to a `digest` file. [`select`] inspects a directory
//! and picks the backend whose layout it contains.

mod compact;
mod plain;

pub use self::compact::CompactBackend;
pub use self::plain::PlainBackend;
use crate::error::{ErrorKind, Result};
use crate::index::{BundleRef, PackageIndex};
use crate::source::SourceCatalog;
use async_trait::async_trait;
use futures::Stream;
use opcat_model::api::Bundle;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

pub type BundleStream<'a> = Pin<Box<dyn Stream<Item = Result<Bundle>> + Send + 'a>>;
pub type BackendHandle = Arc<dyn CacheBackend>;

const DIGEST_FILE: &str = "digest";

/// Unified interface for cache storage.
///
/// A backend is constructed closed. [`init`](Self::init) wipes any previous
/// contents and leaves the backend open; [`open`](Self::open) reuses what is
/// on disk. Every other operation fails with
/// [`NotOpen`](crate::error::ErrorKind::NotOpen) on a closed backend.
///
/// Bundle writes for different keys may run concurrently. Nothing else
/// should write to the directory while a build is running.
///
/// # Examples
///
/// ```no_run
/// use futures::TryStreamExt;
/// use opcat_cache::backend::CacheBackend;
/// # use opcat_cache::error::Result;
/// # async fn example(backend: &dyn CacheBackend) -> Result<()> {
/// backend.open().await?;
/// let index = backend.get_package_index().await?;
/// println!("{} packages", index.len());
///
/// let mut bundles = backend.send_bundles();
/// while let Some(bundle) = bundles.try_next().await? {
///     println!("{}/{}", bundle.package_name, bundle.csv_name);
/// }
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name of the layout, for logging.
    fn name(&self) -> &'static str;

    /// The cache directory this backend owns.
    fn directory(&self) -> &Path;

    /// Remove everything this backend stored, then open it empty.
    async fn init(&self) -> Result<()>;

    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if no index
    /// was ever written.
    async fn get_package_index(&self) -> Result<PackageIndex>;

    async fn put_package_index(&self, index: &PackageIndex) -> Result<()>;

    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the bundle
    /// is not stored.
    async fn get_bundle(&self, key: &BundleRef) -> Result<Bundle>;

    async fn put_bundle(&self, key: &BundleRef, bundle: &Bundle) -> Result<()>;

    /// The digest written by the last completed build, if any.
    async fn get_digest(&self) -> Result<Option<String>> {
        read_digest(self.directory()).await
    }

    async fn put_digest(&self, digest: &str) -> Result<()> {
        write_digest(self.directory(), digest).await
    }

    /// Hash `source` together with everything currently stored. Identical
    /// inputs always produce the same hex string.
    async fn compute_digest(&self, source: &SourceCatalog) -> Result<String>;

    /// Stream every stored bundle once, in key order.
    fn send_bundles(&self) -> BundleStream<'_>;
}

async fn read_digest(directory: &Path) -> Result<Option<String>> {
    let path = directory.join(DIGEST_FILE);
    match fs::read_to_string(&path).await {
        Ok(digest) => Ok(Some(digest.trim().to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => exn::bail!(ErrorKind::io(err, &path)),
    }
}

async fn write_digest(directory: &Path, digest: &str) -> Result<()> {
    let path = directory.join(DIGEST_FILE);
    Ok(fs::write(&path, format!("{digest}\n")).await.map_err(|e| ErrorKind::io(e, &path))?)
}

/// Remove a file or directory tree, treating "already gone" as success.
async fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => exn::bail!(ErrorKind::io(err, path)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Compact,
    Plain,
}
impl Layout {
    /// Every top-level entry the layout may create, and the ones that
    /// identify it.
    fn signature(self) -> (&'static [&'static str], &'static [&'static str]) {
        match self {
            Self::Compact => (&[compact::STORE_DIR, DIGEST_FILE], &[compact::STORE_DIR]),
            Self::Plain => (&[plain::CACHE_DIR, plain::INDEX_FILE, DIGEST_FILE], &[
                plain::CACHE_DIR,
                plain::INDEX_FILE,
            ]),
        }
    }

    fn matches(self, entries: &BTreeSet<String>) -> bool {
        let (allowed, markers) = self.signature();
        entries.iter().all(|e| allowed.contains(&e.as_str())) && markers.iter().any(|m| entries.contains(*m))
    }
}

/// Pick the backend for `directory` from its top-level contents.
///
/// A missing or empty directory gets the compact backend. Otherwise the
/// contents must belong to exactly one layout, or selection fails with
/// [`UnexpectedContents`](crate::error::ErrorKind::UnexpectedContents).
pub async fn select(directory: impl Into<PathBuf>) -> Result<BackendHandle> {
    let directory = directory.into();
    let mut entries = BTreeSet::new();
    match fs::read_dir(&directory).await {
        Ok(mut dir) => {
            while let Some(entry) = dir.next_entry().await.map_err(|e| ErrorKind::io(e, &directory))? {
                entries.insert(entry.file_name().to_string_lossy().into_owned());
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
        Err(err) => exn::bail!(ErrorKind::io(err, &directory)),
    }

    let layout = if entries.is_empty() {
        Layout::Compact
    } else {
        match (Layout::Compact.matches(&entries), Layout::Plain.matches(&entries)) {
            (true, false) => Layout::Compact,
            (false, true) => Layout::Plain,
            _ => exn::bail!(ErrorKind::UnexpectedContents(directory)),
        }
    };
    info!(directory = %directory.display(), ?layout, "selected cache backend");
    let backend: BackendHandle = match layout {
        Layout::Compact => Arc::new(CompactBackend::new(directory)),
        Layout::Plain => Arc::new(PlainBackend::new(directory)),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::missing(&[], Some("compact"))]
    #[case::compact(&["store", "digest"], Some("compact"))]
    #[case::compact_unfinished(&["store"], Some("compact"))]
    #[case::plain(&["cache", "packages.json", "digest"], Some("plain"))]
    #[case::both(&["store", "cache", "packages.json"], None)]
    #[case::digest_only(&["digest"], None)]
    #[case::stranger(&["store", "digest", "notes.txt"], None)]
    #[tokio::test]
    async fn test_select(#[case] contents: &[&str], #[case] expected: Option<&str>) {
        let dir = tempfile::tempdir().unwrap();
        for name in contents {
            let path = dir.path().join(name);
            if name.contains('.') || *name == DIGEST_FILE {
                std::fs::write(path, b"").unwrap();
            } else {
                std::fs::create_dir(path).unwrap();
            }
        }
        match (select(dir.path()).await, expected) {
            (Ok(backend), Some(name)) => assert_eq!(backend.name(), name),
            (Err(err), None) => assert!(matches!(&*err, ErrorKind::UnexpectedContents(_))),
            (Ok(backend), None) => panic!("expected selection to fail, got {}", backend.name()),
            (Err(err), Some(_)) => panic!("selection failed: {err:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_directory_selects_compact() {
        let dir = tempfile::tempdir().unwrap();
        let backend = select(dir.path().join("fresh")).await.unwrap();
        assert_eq!(backend.name(), "compact");
    }

    #[tokio::test]
    async fn test_digest_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_digest(dir.path()).await.unwrap(), None);
        write_digest(dir.path(), "abc123").await.unwrap();
        assert_eq!(read_digest(dir.path()).await.unwrap().as_deref(), Some("abc123"));
        remove_path(&dir.path().join(DIGEST_FILE)).await.unwrap();
        remove_path(&dir.path().join(DIGEST_FILE)).await.unwrap();
        assert_eq!(read_digest(dir.path()).await.unwrap(), None);
    }
}
