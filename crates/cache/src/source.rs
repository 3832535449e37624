//! Declarative-config source catalogs.
//!
//! A source catalog is a directory tree of `*.json` files, each holding a
//! stream of metas (JSON objects with a `schema` field). Metas for one
//! package may be spread across any number of files.

use crate::declcfg::PACKAGE_SCHEMA;
use crate::error::{ErrorKind, Result};
use crate::walk;
use exn::ResultExt;
use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Concurrent file reads while splitting or hashing a catalog.
const READ_CONCURRENCY: usize = 16;

/// All metas owned by one package, concatenated in file then stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PackageSource {
    pub(crate) name: String,
    pub(crate) metas: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SourceCatalog {
    root: PathBuf,
}
impl SourceCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every meta file, as sorted paths relative to the root.
    pub async fn files(&self) -> Result<Vec<PathBuf>> {
        if !tokio::fs::try_exists(&self.root).await.map_err(|e| ErrorKind::io(e, &self.root))? {
            exn::bail!(ErrorKind::NotFound(format!("source catalog {}", self.root.display())));
        }
        walk::files(&self.root, |p| p.extension().is_some_and(|e| e == "json")).await
    }

    /// Read every meta file, in sorted path order.
    async fn read_all(&self) -> Result<Vec<(PathBuf, Vec<u8>)>> {
        let files = self.files().await?;
        stream::iter(files)
            .map(|relative| async move {
                let absolute = self.root.join(&relative);
                let bytes = tokio::fs::read(&absolute).await.map_err(|e| ErrorKind::io(e, &absolute))?;
                Ok::<_, crate::error::Error>((relative, bytes))
            })
            .buffered(READ_CONCURRENCY)
            .try_collect()
            .await
    }

    /// Hash of every meta file's relative path and contents.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn digest(&self) -> Result<blake3::Hash> {
        let mut hasher = blake3::Hasher::new();
        for (relative, bytes) in self.read_all().await? {
            hash_entry(&mut hasher, relative.to_string_lossy().as_bytes(), &bytes);
        }
        Ok(hasher.finalize())
    }

    /// Group the catalog's metas by owning package.
    ///
    /// An `olm.package` meta is owned by its `name`, every other meta by its
    /// `package` field. Metas with neither are skipped.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub(crate) async fn split_by_package(&self) -> Result<BTreeMap<String, PackageSource>> {
        let mut packages = BTreeMap::new();
        for (relative, bytes) in self.read_all().await? {
            split_metas(&relative, &bytes, &mut packages)?;
        }
        debug!(packages = packages.len(), "split source catalog");
        Ok(packages)
    }
}

/// Feed one length-prefixed `(name, bytes)` pair into a digest.
pub(crate) fn hash_entry(hasher: &mut blake3::Hasher, name: &[u8], bytes: &[u8]) {
    hasher.update(&(name.len() as u64).to_le_bytes());
    hasher.update(name);
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn split_metas(file: &Path, bytes: &[u8], packages: &mut BTreeMap<String, PackageSource>) -> Result<()> {
    let mut metas = serde_json::Deserializer::from_slice(bytes).into_iter::<Value>();
    let mut start = 0;
    while let Some(meta) = metas.next() {
        let meta = meta.or_raise(|| ErrorKind::InvalidSource(file.display().to_string()))?;
        let end = metas.byte_offset();
        let owner_field = match meta.get("schema").and_then(Value::as_str) {
            Some(PACKAGE_SCHEMA) => "name",
            _ => "package",
        };
        match meta.get(owner_field).and_then(Value::as_str).filter(|p| !p.is_empty()) {
            Some(package) => {
                let source = packages.entry(package.to_string()).or_insert_with(|| PackageSource {
                    name: package.to_string(),
                    metas: Vec::new(),
                });
                source.metas.extend_from_slice(bytes[start..end].trim_ascii());
                source.metas.push(b'\n');
            },
            None => debug!(file = %file.display(), offset = start, "skipping meta with no owning package"),
        }
        start = end;
    }
    Ok(())
}
