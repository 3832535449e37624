//! Cache engine: build, verify and load a cache from a source catalog.

use crate::backend::{self, BackendHandle, CacheBackend};
use crate::declcfg::DeclarativePackage;
use crate::error::{ErrorKind, Result};
use crate::index::{BundleRef, PackageIndex, PackageIndexEntry};
use crate::query::CacheQuerier;
use crate::source::{PackageSource, SourceCatalog};
use exn::ResultExt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Worker count when none is configured.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

/// Parse one package, store every channel member and return its index entry.
async fn index_package(backend: &dyn CacheBackend, source: PackageSource) -> Result<PackageIndexEntry> {
    let package = DeclarativePackage::parse(&source.name, &source.metas)?;
    let entry = PackageIndexEntry::build(&package)?;
    let bundles = package.channel_bundles()?;
    for bundle in &bundles {
        let key = BundleRef::new(&bundle.package_name, &bundle.channel_name, &bundle.csv_name);
        backend.put_bundle(&key, bundle).await?;
    }
    debug!(package = %entry.name, channels = entry.channels.len(), bundles = bundles.len(), "indexed package");
    Ok(entry)
}

/// A cache over one backend.
///
/// Building needs `&mut self`, so a cache being built cannot be queried at
/// the same time. Queriers handed out earlier keep the index they were
/// created with.
///
/// # Examples
///
/// ```no_run
/// use opcat_cache::{Cache, SourceCatalog};
/// use opcat_query::Query;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut cache = Cache::open("/var/cache/opcat").await?;
/// cache.load_or_rebuild(&SourceCatalog::new("/srv/catalog")).await?;
/// let head = cache.querier()?.get_bundle_for_channel("etcd", "alpha").await?;
/// println!("{}", head.csv_name);
/// # Ok(())
/// # }
/// ```
pub struct Cache {
    backend: BackendHandle,
    parallelism: usize,
    index: Option<Arc<PackageIndex>>,
}
impl Cache {
    /// Select a backend for `directory` from its contents.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::with_backend(backend::select(directory).await?))
    }

    pub fn with_backend(backend: BackendHandle) -> Self {
        Self { backend, parallelism: default_parallelism(), index: None }
    }

    /// Number of packages built concurrently (at least one).
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn backend(&self) -> &BackendHandle {
        &self.backend
    }

    /// Compare the stored digest with one computed from `source` and the
    /// current cache contents.
    ///
    /// Fails with [`DigestMismatch`](ErrorKind::DigestMismatch) if they
    /// differ or nothing was stored yet.
    #[instrument(skip_all, fields(backend = self.backend.name(), source = %source.root().display()))]
    pub async fn check_integrity(&self, source: &SourceCatalog) -> Result<()> {
        self.backend.open().await?;
        let computed = self.backend.compute_digest(source).await?;
        match self.backend.get_digest().await? {
            Some(stored) if stored == computed => Ok(()),
            stored => exn::bail!(ErrorKind::DigestMismatch {
                stored: stored.unwrap_or_else(|| "<none>".to_string()),
                computed,
            }),
        }
    }

    pub async fn build(&mut self, source: &SourceCatalog) -> Result<()> {
        self.build_with_cancel(source, CancellationToken::new()).await
    }

    /// Rebuild the cache from `source`.
    ///
    /// Packages are spread over a pool of workers. The first failing package
    /// stops the others and its error is returned. Cancelling `token` stops
    /// the build with [`Cancelled`](ErrorKind::Cancelled). A failed or
    /// cancelled build leaves no digest behind, so the next integrity check
    /// asks for a rebuild.
    #[instrument(skip_all, fields(backend = self.backend.name(), source = %source.root().display()))]
    pub async fn build_with_cancel(&mut self, source: &SourceCatalog, token: CancellationToken) -> Result<()> {
        self.index = None;
        self.backend.init().await?;
        let packages = source.split_by_package().await?;
        let total = packages.len();
        info!(packages = total, workers = self.parallelism, "building cache");

        // Our own failures cancel the child only, never the caller's token.
        let cancel = token.child_token();
        let (tx, rx) = mpsc::channel::<PackageSource>(self.parallelism);
        let rx = Arc::new(Mutex::new(rx));
        let index = Arc::new(Mutex::new(PackageIndex::default()));
        let mut workers = JoinSet::new();
        for _ in 0..self.parallelism.min(total.max(1)) {
            let (rx, index, backend, cancel) = (rx.clone(), index.clone(), self.backend.clone(), cancel.clone());
            workers.spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        next = async { rx.lock().await.recv().await } => next,
                    };
                    let Some(package) = next else {
                        return Ok(());
                    };
                    let name = package.name.clone();
                    let entry = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        entry = index_package(backend.as_ref(), package) => entry,
                    };
                    match entry {
                        Ok(entry) => index.lock().await.insert(entry),
                        Err(err) => {
                            warn!(package = %name, error = %*err, "package failed, cancelling build");
                            cancel.cancel();
                            return Err(err);
                        },
                    }
                }
            });
        }
        drop(rx);

        for package in packages.into_values() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(package) => {
                    if sent.is_err() {
                        break;
                    }
                },
            }
        }
        drop(tx);

        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined.or_raise(|| ErrorKind::Worker).and_then(|result| result) {
                cancel.cancel();
                failure.get_or_insert(err);
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        if token.is_cancelled() {
            exn::bail!(ErrorKind::Cancelled);
        }

        let index = std::mem::take(&mut *index.lock().await);
        self.backend.put_package_index(&index).await?;
        let digest = self.backend.compute_digest(source).await?;
        self.backend.put_digest(&digest).await?;
        info!(packages = index.len(), %digest, "cache built");
        self.index = Some(Arc::new(index));
        Ok(())
    }

    /// Read the stored package index into memory.
    #[instrument(skip_all, fields(backend = self.backend.name()))]
    pub async fn load(&mut self) -> Result<()> {
        self.backend.open().await?;
        let index = self.backend.get_package_index().await?;
        debug!(packages = index.len(), "loaded package index");
        self.index = Some(Arc::new(index));
        Ok(())
    }

    /// Load the cache, rebuilding it if it does not match `source` or if
    /// its store or package index cannot be read back.
    pub async fn load_or_rebuild(&mut self, source: &SourceCatalog) -> Result<()> {
        let stale = match self.check_integrity(source).await {
            Ok(()) => match self.load().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_integrity() => err,
                Err(err) => return Err(err),
            },
            Err(err) if err.is_integrity() => err,
            Err(err) => return Err(err),
        };
        info!(reason = %*stale, "cache is stale, rebuilding");
        self.build(source).await
    }

    pub fn index(&self) -> Option<&Arc<PackageIndex>> {
        self.index.as_ref()
    }

    /// A query handle over the loaded index.
    pub fn querier(&self) -> Result<CacheQuerier> {
        match &self.index {
            Some(index) => Ok(CacheQuerier::new(self.backend.clone(), index.clone())),
            None => exn::bail!(ErrorKind::NotLoaded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PlainBackend;
    use crate::declcfg::tests::ACME;
    use crate::source::tests::write_catalog;
    use opcat_query::Query;
    use rstest::rstest;

    const BROKEN: &str = r#"
        {"schema":"olm.package","name":"broken","defaultChannel":"stable"}
        {"schema":"olm.channel","package":"broken","name":"stable","entries":[{"name":"broken.v1"},{"name":"broken.v2"}]}
        {"schema":"olm.bundle","package":"broken","name":"broken.v1"}
        {"schema":"olm.bundle","package":"broken","name":"broken.v2"}
    "#;

    /// Twelve copies of `acme` under different names, so builds have enough
    /// packages to spread over several workers.
    fn fleet() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let catalogs: Vec<(String, String)> = (0..12)
            .map(|i| (format!("fleet/pkg{i:02}.json"), ACME.replace("acme", &format!("acme{i:02}"))))
            .collect();
        let files: Vec<(&str, &str)> = catalogs.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
        write_catalog(dir.path(), &files);
        dir
    }

    #[rstest]
    #[case::compact(false)]
    #[case::plain(true)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_digest_independent_of_parallelism(#[case] plain: bool) {
        let source_dir = fleet();
        let source = SourceCatalog::new(source_dir.path());
        let mut digests = Vec::new();
        for parallelism in [1, 4] {
            let dir = tempfile::tempdir().unwrap();
            let cache = if plain {
                Cache::with_backend(Arc::new(PlainBackend::new(dir.path())))
            } else {
                Cache::open(dir.path()).await.unwrap()
            };
            let mut cache = cache.with_parallelism(parallelism);
            cache.build(&source).await.unwrap();
            cache.check_integrity(&source).await.unwrap();
            digests.push(cache.backend().get_digest().await.unwrap().unwrap());
            assert_eq!(cache.index().unwrap().len(), 12);
        }
        assert_eq!(digests[0], digests[1]);
    }

    #[tokio::test]
    async fn test_tampering_detected_and_rebuilt() {
        let source_dir = fleet();
        let source = SourceCatalog::new(source_dir.path());
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::with_backend(Arc::new(PlainBackend::new(dir.path())));
        cache.build(&source).await.unwrap();

        let file = dir.path().join("cache/acme03/stable/acme03.v2.json");
        std::fs::write(&file, b"{}").unwrap();
        let err = cache.check_integrity(&source).await.unwrap_err();
        assert!(err.is_integrity());

        // A fresh engine over the same directory picks the plain layout again.
        let mut reopened = Cache::open(dir.path()).await.unwrap();
        assert_eq!(reopened.backend().name(), "plain");
        reopened.load_or_rebuild(&source).await.unwrap();
        reopened.check_integrity(&source).await.unwrap();
        assert_ne!(std::fs::read(&file).unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_corrupt_store_rebuilt() {
        let source_dir = fleet();
        let source = SourceCatalog::new(source_dir.path());
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(dir.path()).await.unwrap();
        cache.build(&source).await.unwrap();
        cache.backend().close().await.unwrap();
        drop(cache);

        let store = dir.path().join("store/catalog.redb");
        std::fs::write(&store, vec![0x5a; 8192]).unwrap();
        let mut reopened = Cache::open(dir.path()).await.unwrap();
        assert_eq!(reopened.backend().name(), "compact");
        assert!(reopened.check_integrity(&source).await.unwrap_err().is_integrity());

        reopened.load_or_rebuild(&source).await.unwrap();
        assert_eq!(reopened.index().unwrap().len(), 12);
        reopened.check_integrity(&source).await.unwrap();
        let head = reopened.querier().unwrap().get_bundle_for_channel("acme04", "stable").await.unwrap();
        assert_eq!(head.csv_name, "acme04.v2");
    }

    #[tokio::test]
    async fn test_source_change_detected() {
        let source_dir = fleet();
        let source = SourceCatalog::new(source_dir.path());
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(dir.path()).await.unwrap();
        cache.build(&source).await.unwrap();
        cache.check_integrity(&source).await.unwrap();

        write_catalog(source_dir.path(), &[("late.json", r#"{"schema":"olm.package","name":"late","defaultChannel":"a"}"#)]);
        assert!(cache.check_integrity(&source).await.unwrap_err().is_integrity());
    }

    #[tokio::test]
    async fn test_load_without_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(dir.path()).await.unwrap();
        assert!(matches!(&*cache.querier().unwrap_err(), ErrorKind::NotLoaded));
        assert!(cache.load().await.unwrap_err().is_not_found());
        let source_dir = fleet();
        let err = cache.check_integrity(&SourceCatalog::new(source_dir.path())).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::DigestMismatch { stored, .. } if stored == "<none>"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_package_fails_build() {
        let source_dir = fleet();
        write_catalog(source_dir.path(), &[("broken.json", BROKEN)]);
        let source = SourceCatalog::new(source_dir.path());
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(dir.path()).await.unwrap().with_parallelism(4);
        let err = cache.build(&source).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPackage { package, .. } if package == "broken"));
        assert!(cache.querier().is_err());
        assert_eq!(cache.backend().get_digest().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancelled_build() {
        let source_dir = fleet();
        let source = SourceCatalog::new(source_dir.path());
        let dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(dir.path()).await.unwrap().with_parallelism(2);
        let token = CancellationToken::new();
        token.cancel();
        let err = cache.build_with_cancel(&source, token).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Cancelled));
        assert_eq!(cache.backend().get_digest().await.unwrap(), None);
    }
}
