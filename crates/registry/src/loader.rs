//! Relational loader: persists bundles and channel graphs.
//!
//! Channel membership is materialized as `channel_entry` rows by walking each
//! channel head's `replaces` chain. Skipped bundles get a placeholder entry at
//! the depth of the next hop, plus an extra entry for the skipping bundle that
//! replaces the placeholder, so "what replaces X?" has an answer even when X
//! never shipped in the channel.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::store::UnitOfWork;
use derive_more::Display;
use exn::ResultExt;
use opcat_model::graph::ReplacementWalk;
use opcat_model::{Bundle, PackageChannel, PackageManifest};
use serde::{Deserialize, Serialize};
use sqlx::{Acquire, SqlitePool};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

/// How batch operations react to a failing item.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Stop at the first failure. Items already processed stay committed.
    #[display("strict")]
    Strict,
    /// Log each failure, carry on, and report every failure at the end.
    #[default]
    #[display("permissive")]
    Permissive,
}

/// Writes bundles and package channel graphs into a registry database.
///
/// Every public operation runs in its own transaction.
#[derive(Debug, Clone)]
pub struct Loader {
    pub(crate) pool: SqlitePool,
    pub(crate) mode: LoadMode,
    enable_alpha: bool,
}
impl From<&Database> for Loader {
    fn from(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }
}
impl Loader {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, mode: LoadMode::default(), enable_alpha: false }
    }

    pub fn with_mode(mut self, mode: LoadMode) -> Self {
        self.mode = mode;
        self
    }

    /// Allow alpha bundle features (`substitutesFor`).
    pub fn with_alpha(mut self, enable: bool) -> Self {
        self.enable_alpha = enable;
        self
    }

    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    // =========================================================================
    // Bundles
    // =========================================================================

    /// Insert a bundle with its related images, properties, dependencies and
    /// provided/required APIs.
    ///
    /// Fails with [`ErrorKind::UnsupportedFeature`] if the bundle substitutes
    /// for another and alpha features are disabled, and with
    /// [`ErrorKind::AlreadyExists`] if a bundle of the same name is stored.
    #[instrument(skip_all, fields(bundle = %bundle.name))]
    pub async fn add_bundle(&self, bundle: &Bundle) -> Result<()> {
        if bundle.name.is_empty() {
            exn::bail!(ErrorKind::InvalidManifest("bundle has no name".to_string()));
        }
        if bundle.substitutes_for.as_deref().is_some_and(|s| !s.is_empty()) && !self.enable_alpha {
            exn::bail!(ErrorKind::UnsupportedFeature("substitutesFor"));
        }
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut work = UnitOfWork::new(&mut *tx);
        if work.bundle_exists(&bundle.name).await? {
            exn::bail!(ErrorKind::AlreadyExists(bundle.name.clone()));
        }
        work.insert_bundle(bundle).await?;
        if work.is_deprecated(&bundle.name).await? {
            work.tombstone(&bundle.name).await?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        debug!("bundle added");
        Ok(())
    }

    /// Add several bundles, each in its own transaction, honouring the
    /// loader's [`LoadMode`].
    pub async fn add_bundles<'a>(&self, bundles: impl IntoIterator<Item = &'a Bundle>) -> Result<()> {
        let mut failures = Vec::new();
        for bundle in bundles {
            if let Err(err) = self.add_bundle(bundle).await {
                if self.mode == LoadMode::Strict {
                    return Err(err);
                }
                warn!(bundle = %bundle.name, error = %*err, "skipping bundle");
                failures.push(format!("{}: {}", bundle.name, *err));
            }
        }
        finish_batch(failures)
    }

    // =========================================================================
    // Packages
    // =========================================================================

    /// Persist the channel graphs of a package.
    ///
    /// Existing channels of the package are replaced. Each channel is loaded
    /// inside its own savepoint: a channel with a structural problem (cycle,
    /// missing `replaces` target, missing head) leaves no entries behind, the
    /// other channels are kept, and the failures are returned together as
    /// [`ErrorKind::InvalidChannels`]. Channels whose head is deprecated are
    /// skipped. If the default channel does not load, nothing is kept.
    #[instrument(skip_all, fields(package = %manifest.package_name))]
    pub async fn add_package_channels(&self, manifest: &PackageManifest) -> Result<()> {
        validate_manifest(manifest)?;
        let package = manifest.package_name.as_str();
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        {
            let mut work = UnitOfWork::new(&mut *tx);
            work.delete_channels(package).await?;
            work.upsert_package(package, &manifest.default_channel_name).await?;
        }
        let mut loaded = BTreeSet::new();
        let mut failures = Vec::new();
        for channel in &manifest.channels {
            let mut savepoint = (&mut tx).begin().await.or_raise(|| ErrorKind::Database)?;
            let result = add_channel(&mut UnitOfWork::new(&mut *savepoint), package, channel).await;
            match result {
                Ok(true) => {
                    savepoint.commit().await.or_raise(|| ErrorKind::Database)?;
                    debug!(channel = %channel.name, "channel loaded");
                    loaded.insert(channel.name.as_str());
                },
                Ok(false) => {
                    savepoint.rollback().await.or_raise(|| ErrorKind::Database)?;
                    info!(channel = %channel.name, head = %channel.current_csv_name, "head is deprecated, skipping channel");
                },
                Err(err) => {
                    savepoint.rollback().await.or_raise(|| ErrorKind::Database)?;
                    if matches!(&*err, ErrorKind::Database) {
                        return Err(err);
                    }
                    warn!(channel = %channel.name, error = %*err, "channel failed to load");
                    failures.push(format!("channel {}: {}", channel.name, *err));
                },
            }
        }
        if !loaded.contains(manifest.default_channel_name.as_str()) {
            failures.push(format!("default channel {} did not load", manifest.default_channel_name));
            // Dropping the transaction rolls everything back.
            exn::bail!(ErrorKind::InvalidChannels { package: package.to_string(), errors: failures });
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        if !failures.is_empty() {
            exn::bail!(ErrorKind::InvalidChannels { package: package.to_string(), errors: failures });
        }
        Ok(())
    }

    /// Delete a package, its channels, entries and API links, and the bundles
    /// that belonged only to it.
    #[instrument(skip(self))]
    pub async fn remove_package(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        if !UnitOfWork::new(&mut *tx).delete_package(name).await? {
            exn::bail!(ErrorKind::NotFound(format!("package {name}")));
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        info!("package removed");
        Ok(())
    }

    /// Remove several packages, honouring the loader's [`LoadMode`].
    pub async fn remove_packages(&self, names: impl IntoIterator<Item = impl AsRef<str>>) -> Result<()> {
        let mut failures = Vec::new();
        for name in names {
            let name = name.as_ref();
            if let Err(err) = self.remove_package(name).await {
                if self.mode == LoadMode::Strict {
                    return Err(err);
                }
                warn!(package = %name, error = %*err, "failed to remove package");
                failures.push(format!("{name}: {}", *err));
            }
        }
        finish_batch(failures)
    }

    /// Delete every bundle no channel entry refers to, unless it is
    /// tombstoned. Returns the number of bundles removed.
    #[instrument(skip(self))]
    pub async fn remove_stranded_bundles(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let removed = UnitOfWork::new(&mut *tx).remove_stranded().await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        info!(removed, "removed stranded bundles");
        Ok(removed)
    }
}

pub(crate) fn finish_batch(failures: Vec<String>) -> Result<()> {
    match failures.is_empty() {
        true => Ok(()),
        false => exn::bail!(ErrorKind::Batch(failures)),
    }
}

fn validate_manifest(manifest: &PackageManifest) -> Result<()> {
    if manifest.package_name.is_empty() {
        exn::bail!(ErrorKind::InvalidManifest("package has no name".to_string()));
    }
    if manifest.channels.is_empty() {
        exn::bail!(ErrorKind::InvalidManifest(format!("package {} has no channels", manifest.package_name)));
    }
    if manifest.channel(&manifest.default_channel_name).is_none() {
        exn::bail!(ErrorKind::InvalidManifest(format!(
            "default channel {} is not a channel of {}",
            manifest.default_channel_name, manifest.package_name
        )));
    }
    let mut names = BTreeSet::new();
    if let Some(duplicate) = manifest.channels.iter().find(|c| !names.insert(c.name.as_str())) {
        exn::bail!(ErrorKind::InvalidManifest(format!("channel {} declared twice", duplicate.name)));
    }
    Ok(())
}

/// Insert one channel and its entries. Returns `false` if the channel was
/// elided because its head is deprecated.
async fn add_channel(work: &mut UnitOfWork<'_>, package: &str, channel: &PackageChannel) -> Result<bool> {
    let head = channel.current_csv_name.as_str();
    if work.is_deprecated(head).await? {
        return Ok(false);
    }
    if !work.bundle_exists(head).await? {
        exn::bail!(ErrorKind::NotFound(format!("channel head {head}")));
    }
    work.insert_channel(package, &channel.name, head).await?;
    let mut current_entry = work.insert_entry(package, &channel.name, head, 0).await?;
    work.link_apis(current_entry, head).await?;
    work.record_package(head, package).await?;

    let mut walk = ReplacementWalk::new(head);
    loop {
        let current = walk.current().to_string();
        let Some((replaces, skips)) = work.edges(&current).await? else {
            break;
        };
        let hop = walk.advance(replaces.as_deref(), &skips).map_err(ErrorKind::graph)?;
        for skip in &hop.skips {
            let skipped = work.insert_entry(package, &channel.name, skip, hop.depth).await?;
            let synthetic = work.insert_entry(package, &channel.name, &current, hop.depth).await?;
            work.set_replaces(synthetic, skipped).await?;
            work.link_apis(synthetic, &current).await?;
        }
        let Some(next) = hop.next else {
            break;
        };
        if !work.bundle_exists(&next).await? {
            if work.is_deprecated(&next).await? {
                debug!(bundle = %current, replaces = %next, "replaces a deprecated bundle, truncating");
                break;
            }
            exn::bail!(ErrorKind::ReplacesNotFound { bundle: current, replaces: next });
        }
        let next_entry = work.insert_entry(package, &channel.name, &next, hop.depth).await?;
        work.set_replaces(current_entry, next_entry).await?;
        work.link_apis(next_entry, &next).await?;
        work.record_package(&next, package).await?;
        current_entry = next_entry;
    }
    Ok(true)
}
