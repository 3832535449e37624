//! Embedded key-value cache backend.
//!
//! Everything lives in one `redb` file under `store/`. Bundle records and the
//! package index are `bincode`-encoded. All `redb` calls block, so each one
//! runs on the blocking thread pool.

use crate::backend::{BundleStream, CacheBackend};
use crate::error::{ErrorKind, Result};
use crate::index::{BundleRef, PackageIndex};
use crate::source::{SourceCatalog, hash_entry};
use async_stream::stream;
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use opcat_model::api::Bundle;
use redb::{Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

pub(super) const STORE_DIR: &str = "store";
const STORE_FILE: &str = "catalog.redb";
type Table = TableDefinition<'static, &'static str, &'static [u8]>;
const BUNDLES: Table = TableDefinition::new("bundles");
const META: Table = TableDefinition::new("meta");
const INDEX_KEY: &str = "index";

fn bundle_key(key: &BundleRef) -> String {
    key.to_string()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).or_raise(|| ErrorKind::Encoding("bincode"))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).or_raise(|| ErrorKind::Encoding("bincode"))
}

/// Classify a failure to open the store file. Anything but a lock or an I/O
/// error means the file is not a usable store.
fn open_error(err: DatabaseError, path: &Path) -> ErrorKind {
    match err {
        DatabaseError::DatabaseAlreadyOpen => ErrorKind::Backend("store is already open".to_string()),
        DatabaseError::Storage(StorageError::Io(err)) if err.kind() != std::io::ErrorKind::UnexpectedEof => {
            ErrorKind::io(err, path)
        },
        other => ErrorKind::Corrupt(other.to_string()),
    }
}

fn put(db: &Database, table: Table, key: &str, value: &[u8]) -> Result<()> {
    let txn = db.begin_write().or_raise(|| ErrorKind::Backend("begin write".to_string()))?;
    {
        let mut table = txn.open_table(table).or_raise(|| ErrorKind::Backend("open table".to_string()))?;
        table.insert(key, value).or_raise(|| ErrorKind::Backend(format!("insert {key}")))?;
    }
    txn.commit().or_raise(|| ErrorKind::Backend("commit".to_string()))
}

fn get(db: &Database, table: Table, key: &str) -> Result<Option<Vec<u8>>> {
    let txn = db.begin_read().or_raise(|| ErrorKind::Backend("begin read".to_string()))?;
    let table = match txn.open_table(table) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err).or_raise(|| ErrorKind::Backend("open table".to_string())),
    };
    let value = table.get(key).or_raise(|| ErrorKind::Backend(format!("get {key}")))?;
    Ok(value.map(|v| v.value().to_vec()))
}

/// Every `(key, value)` of a table. `redb` tables are B-trees, so keys come
/// back in byte order.
fn entries(db: &Database, table: Table) -> Result<Vec<(String, Vec<u8>)>> {
    let txn = db.begin_read().or_raise(|| ErrorKind::Backend("begin read".to_string()))?;
    let table = match txn.open_table(table) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(err) => return Err(err).or_raise(|| ErrorKind::Backend("open table".to_string())),
    };
    let mut out = Vec::new();
    for item in table.range::<&str>(..).or_raise(|| ErrorKind::Backend("range".to_string()))? {
        let (key, value) = item.or_raise(|| ErrorKind::Backend("read entry".to_string()))?;
        out.push((key.value().to_string(), value.value().to_vec()));
    }
    Ok(out)
}

/// Cache backend on a single embedded `redb` store.
///
/// # Examples
///
/// ```no_run
/// use opcat_cache::backend::{CacheBackend, CompactBackend};
/// # async fn example() -> opcat_cache::error::Result<()> {
/// let backend = CompactBackend::new("/var/cache/opcat");
/// backend.open().await?;
/// let index = backend.get_package_index().await?;
/// # Ok(())
/// # }
/// ```
pub struct CompactBackend {
    directory: PathBuf,
    db: RwLock<Option<Arc<Database>>>,
}
impl CompactBackend {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into(), db: RwLock::new(None) }
    }

    fn store_dir(&self) -> PathBuf {
        self.directory.join(STORE_DIR)
    }

    async fn handle(&self) -> Result<Arc<Database>> {
        self.db.read().await.clone().ok_or_raise(|| ErrorKind::NotOpen)
    }

    /// Run `f` against the open store on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = self.handle().await?;
        tokio::task::spawn_blocking(move || f(&db)).await.or_raise(|| ErrorKind::Worker)?
    }
}

#[async_trait]
impl CacheBackend for CompactBackend {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn directory(&self) -> &Path {
        &self.directory
    }

    #[instrument(skip(self), fields(directory = %self.directory.display()))]
    async fn init(&self) -> Result<()> {
        self.close().await?;
        super::remove_path(&self.store_dir()).await?;
        super::remove_path(&self.directory.join(super::DIGEST_FILE)).await?;
        self.open().await
    }

    async fn open(&self) -> Result<()> {
        let mut db = self.db.write().await;
        if db.is_some() {
            return Ok(());
        }
        let dir = self.store_dir();
        let opened = tokio::task::spawn_blocking(move || -> Result<Database> {
            std::fs::create_dir_all(&dir).map_err(|e| ErrorKind::io(e, &dir))?;
            let file = dir.join(STORE_FILE);
            Ok(Database::create(&file).map_err(|e| open_error(e, &file))?)
        })
        .await
        .or_raise(|| ErrorKind::Worker)??;
        debug!(directory = %self.directory.display(), "opened compact store");
        *db = Some(Arc::new(opened));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The file is released once the last in-flight operation drops its handle.
        self.db.write().await.take();
        Ok(())
    }

    async fn get_package_index(&self) -> Result<PackageIndex> {
        let bytes = self.blocking(|db| get(db, META, INDEX_KEY)).await?;
        let bytes = bytes.ok_or_raise(|| ErrorKind::IndexMissing)?;
        decode(&bytes)
    }

    async fn put_package_index(&self, index: &PackageIndex) -> Result<()> {
        let bytes = encode(index)?;
        self.blocking(move |db| put(db, META, INDEX_KEY, &bytes)).await
    }

    async fn get_bundle(&self, key: &BundleRef) -> Result<Bundle> {
        let k = bundle_key(key);
        let bytes = self.blocking(move |db| get(db, BUNDLES, &k)).await?;
        let bytes = bytes.ok_or_raise(|| ErrorKind::NotFound(format!("bundle {key}")))?;
        decode(&bytes)
    }

    async fn put_bundle(&self, key: &BundleRef, bundle: &Bundle) -> Result<()> {
        let k = bundle_key(key);
        let bytes = encode(bundle)?;
        self.blocking(move |db| put(db, BUNDLES, &k, &bytes)).await
    }

    #[instrument(skip_all, fields(directory = %self.directory.display()))]
    async fn compute_digest(&self, source: &SourceCatalog) -> Result<String> {
        let source_digest = source.digest().await?;
        let stored = self
            .blocking(|db| {
                let mut stored = Vec::new();
                for (name, table) in [("meta", META), ("bundles", BUNDLES)] {
                    for (key, value) in entries(db, table)? {
                        stored.push((format!("{name}/{key}"), value));
                    }
                }
                Ok(stored)
            })
            .await?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(source_digest.as_bytes());
        for (key, value) in &stored {
            hash_entry(&mut hasher, key.as_bytes(), value);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    fn send_bundles(&self) -> BundleStream<'_> {
        Box::pin(stream! {
            let stored = match self.blocking(|db| entries(db, BUNDLES)).await {
                Ok(stored) => stored,
                Err(err) => {
                    yield Err(err);
                    return;
                },
            };
            for (_, bytes) in stored {
                yield decode::<Bundle>(&bytes);
            }
        })
    }
}
