//! One-file-per-bundle cache backend.
//!
//! ```text
//! <directory>/
//!   cache/<package>/<channel>/<bundle>.json
//!   packages.json
//!   digest
//! ```

use crate::backend::{BundleStream, CacheBackend};
use crate::error::{ErrorKind, Result};
use crate::index::{BundleRef, PackageIndex};
use crate::path::bundle_file;
use crate::source::{SourceCatalog, hash_entry};
use crate::walk;
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use opcat_model::api::Bundle;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tracing::instrument;

pub(super) const CACHE_DIR: &str = "cache";
pub(super) const INDEX_FILE: &str = "packages.json";

/// Cache backend on plain JSON files.
pub struct PlainBackend {
    directory: PathBuf,
    open: AtomicBool,
}
impl PlainBackend {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into(), open: AtomicBool::new(false) }
    }

    fn cache_dir(&self) -> PathBuf {
        self.directory.join(CACHE_DIR)
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::NotOpen);
        }
        Ok(())
    }

    fn bundle_path(&self, key: &BundleRef) -> Result<PathBuf> {
        Ok(self.cache_dir().join(bundle_file(&key.package, &key.channel, &key.name)?))
    }

    async fn read(&self, path: &Path, missing: impl FnOnce() -> ErrorKind) -> Result<Vec<u8>> {
        self.ensure_open()?;
        match fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => exn::bail!(missing()),
            Err(err) => exn::bail!(ErrorKind::io(err, path)),
        }
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::io(e, parent))?;
        }
        Ok(fs::write(path, bytes).await.map_err(|e| ErrorKind::io(e, path))?)
    }
}

#[async_trait]
impl CacheBackend for PlainBackend {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn directory(&self) -> &Path {
        &self.directory
    }

    #[instrument(skip(self), fields(directory = %self.directory.display()))]
    async fn init(&self) -> Result<()> {
        self.close().await?;
        super::remove_path(&self.cache_dir()).await?;
        super::remove_path(&self.directory.join(INDEX_FILE)).await?;
        super::remove_path(&self.directory.join(super::DIGEST_FILE)).await?;
        self.open().await
    }

    async fn open(&self) -> Result<()> {
        let dir = self.cache_dir();
        fs::create_dir_all(&dir).await.map_err(|e| ErrorKind::io(e, &dir))?;
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    async fn get_package_index(&self) -> Result<PackageIndex> {
        let bytes = self.read(&self.directory.join(INDEX_FILE), || ErrorKind::IndexMissing).await?;
        serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Encoding("json"))
    }

    async fn put_package_index(&self, index: &PackageIndex) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index).or_raise(|| ErrorKind::Encoding("json"))?;
        self.write(&self.directory.join(INDEX_FILE), &bytes).await
    }

    async fn get_bundle(&self, key: &BundleRef) -> Result<Bundle> {
        let bytes = self.read(&self.bundle_path(key)?, || ErrorKind::NotFound(format!("bundle {key}"))).await?;
        serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Encoding("json"))
    }

    async fn put_bundle(&self, key: &BundleRef, bundle: &Bundle) -> Result<()> {
        let bytes = serde_json::to_vec(bundle).or_raise(|| ErrorKind::Encoding("json"))?;
        self.write(&self.bundle_path(key)?, &bytes).await
    }

    /// Covers the source catalog, `packages.json` and the bytes of every
    /// cache file, so edited or truncated files change the digest.
    #[instrument(skip_all, fields(directory = %self.directory.display()))]
    async fn compute_digest(&self, source: &SourceCatalog) -> Result<String> {
        self.ensure_open()?;
        let source_digest = source.digest().await?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(source_digest.as_bytes());

        let index = match fs::read(self.directory.join(INDEX_FILE)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => exn::bail!(ErrorKind::io(err, self.directory.join(INDEX_FILE))),
        };
        hash_entry(&mut hasher, INDEX_FILE.as_bytes(), &index);

        let cache_dir = self.cache_dir();
        for relative in walk::files(&cache_dir, |_| true).await? {
            let absolute = cache_dir.join(&relative);
            let bytes = fs::read(&absolute).await.map_err(|e| ErrorKind::io(e, &absolute))?;
            hash_entry(&mut hasher, relative.to_string_lossy().as_bytes(), &bytes);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    fn send_bundles(&self) -> BundleStream<'_> {
        Box::pin(stream! {
            if let Err(err) = self.ensure_open() {
                yield Err(err);
                return;
            }
            let cache_dir = self.cache_dir();
            let files = match walk::files(&cache_dir, |p| p.extension().is_some_and(|e| e == "json")).await {
                Ok(files) => files,
                Err(err) => {
                    yield Err(err);
                    return;
                },
            };
            for relative in files {
                let absolute = cache_dir.join(&relative);
                let bundle = match fs::read(&absolute).await {
                    Ok(bytes) => serde_json::from_slice::<Bundle>(&bytes).or_raise(|| ErrorKind::Encoding("json")),
                    Err(err) => Err(exn::Exn::from(ErrorKind::io(err, &absolute))),
                };
                yield bundle;
            }
        })
    }
}
