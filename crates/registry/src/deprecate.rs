//! Bundle deprecation.
//!
//! Deprecating a bundle cuts the upgrade graph below it: everything it
//! (transitively) replaces disappears from the channels it sits in, and the
//! bundle itself is tombstoned so a later load never re-links it to its old
//! predecessors.

use crate::error::{ErrorKind, Result};
use crate::loader::{LoadMode, Loader, finish_batch};
use crate::store::UnitOfWork;
use exn::{OptionExt, ResultExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument, warn};

impl Loader {
    /// Deprecate the bundle stored under `bundle_path`.
    ///
    /// Fails with [`ErrorKind::NotFound`] if no bundle has that path, and with
    /// [`ErrorKind::RemovingDefaultChannelDuringDeprecation`] if the bundle
    /// heads its package's default channel.
    #[instrument(skip(self))]
    pub async fn deprecate_bundle(&self, bundle_path: &str) -> Result<()> {
        let name = self.resolve_path(bundle_path).await?;
        self.deprecate_by_name(&name).await
    }

    /// Deprecate several bundles at once.
    ///
    /// Bundles are grouped by package. When the set covers the head of every
    /// channel of a package, the whole package is removed and its bundles are
    /// tombstoned. Covering the default channel's head without covering the
    /// other heads is an error for that package. Failures honour the
    /// loader's [`LoadMode`].
    #[instrument(skip_all, fields(count = bundle_paths.len()))]
    pub async fn deprecate_bundles(&self, bundle_paths: &[impl AsRef<str>]) -> Result<()> {
        let mut failures = Vec::new();
        let fail = |err: crate::error::Error, failures: &mut Vec<String>| -> Result<()> {
            if self.mode == LoadMode::Strict {
                return Err(err);
            }
            warn!(error = %*err, "deprecation failed");
            failures.push(err.to_string());
            Ok(())
        };

        let mut by_package: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut loose = BTreeSet::new();
        for path in bundle_paths {
            match self.resolve_path(path.as_ref()).await {
                Ok(name) => match self.packages_of(&name).await?.into_iter().next() {
                    Some(package) => {
                        by_package.entry(package).or_default().insert(name);
                    },
                    None => {
                        loose.insert(name);
                    },
                },
                Err(err) => fail(err, &mut failures)?,
            }
        }

        for (package, names) in by_package {
            match self.deprecate_in_package(&package, &names).await {
                Ok(()) => {},
                Err(err) => fail(err, &mut failures)?,
            }
        }
        for name in loose {
            if let Err(err) = self.deprecate_by_name(&name).await {
                fail(err, &mut failures)?;
            }
        }
        finish_batch(failures)
    }

    async fn resolve_path(&self, bundle_path: &str) -> Result<String> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
        let (name, _version) = UnitOfWork::new(&mut conn)
            .bundle_by_path(bundle_path)
            .await?
            .ok_or_raise(|| ErrorKind::NotFound(format!("bundle path {bundle_path}")))?;
        Ok(name)
    }

    async fn packages_of(&self, name: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
        UnitOfWork::new(&mut conn).packages_of(name).await
    }

    /// Deprecate `names`, all members of `package`, in one transaction.
    async fn deprecate_in_package(&self, package: &str, names: &BTreeSet<String>) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut work = UnitOfWork::new(&mut *tx);
        let heads = work.channel_heads(package).await?;
        if heads.values().all(|head| names.contains(head)) {
            work.delete_package(package).await?;
            for name in names {
                work.tombstone(name).await?;
            }
            tx.commit().await.or_raise(|| ErrorKind::Database)?;
            info!(package, "every channel head deprecated, package removed");
            return Ok(());
        }
        if let Some(default_head) = work.default_channel(package).await?.and_then(|d| heads.get(&d).cloned())
            && names.contains(&default_head)
        {
            exn::bail!(ErrorKind::RemovingDefaultChannelDuringDeprecation {
                bundle: default_head,
                package: package.to_string(),
                also_required: missing_heads(&heads, names),
            });
        }
        for name in names {
            deprecate_within(&mut work, name).await?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        info!(package, count = names.len(), "bundles deprecated");
        Ok(())
    }

    /// Deprecate one bundle in its own transaction.
    async fn deprecate_by_name(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        deprecate_within(&mut UnitOfWork::new(&mut *tx), name).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        info!(bundle = name, "bundle deprecated");
        Ok(())
    }
}

/// Cut the graph below `name` and tombstone it. Nothing is committed.
async fn deprecate_within(work: &mut UnitOfWork<'_>, name: &str) -> Result<()> {
    if !work.bundle_exists(name).await? {
        debug!(bundle = name, "bundle already gone, only recording the tombstone");
        return work.tombstone(name).await;
    }
    let packages = work.packages_of(name).await?;
    for package in &packages {
        let heads = work.channel_heads(package).await?;
        if let Some(default) = work.default_channel(package).await?
            && heads.get(&default).is_some_and(|head| head == name)
        {
            exn::bail!(ErrorKind::RemovingDefaultChannelDuringDeprecation {
                bundle: name.to_string(),
                package: package.clone(),
                also_required: missing_heads(&heads, &BTreeSet::from([name.to_string()])),
            });
        }
    }
    let tail = replaced_chain(work, name).await?;
    for package in &packages {
        cut_tail(work, package, name, &tail).await?;
    }
    work.truncate(name).await?;
    for package in &packages {
        let pruned = work.prune_unreachable_entries(package).await?;
        let dropped = work.drop_channels_headed_by(package, name).await?;
        debug!(package, pruned, dropped, "package graph pruned");
    }
    work.tombstone(name).await
}

/// Heads of a package not covered by `names`, deduplicated and sorted.
fn missing_heads(heads: &BTreeMap<String, String>, names: &BTreeSet<String>) -> Vec<String> {
    heads
        .values()
        .filter(|head| !names.contains(*head))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Every bundle reachable from `name` through stored `replaces` edges.
async fn replaced_chain(work: &mut UnitOfWork<'_>, name: &str) -> Result<Vec<String>> {
    let mut seen = BTreeSet::from([name.to_string()]);
    let mut chain = Vec::new();
    let mut cursor = name.to_string();
    while let Some((Some(next), _)) = work.edges(&cursor).await? {
        if !seen.insert(next.clone()) {
            break;
        }
        chain.push(next.clone());
        cursor = next;
    }
    Ok(chain)
}

/// Remove the members of `tail` from every channel of `package` that holds
/// the deprecated bundle, and delete the rows of members that are left with
/// no channel and no replacer outside the tail.
async fn cut_tail(work: &mut UnitOfWork<'_>, package: &str, name: &str, tail: &[String]) -> Result<()> {
    let head_channels = work.channels_of(package, name).await?;
    let mut doomed: BTreeSet<&str> = tail.iter().map(String::as_str).collect();
    doomed.insert(name);

    let mut plans = Vec::with_capacity(tail.len());
    for member in tail {
        let channels = work.channels_of(package, member).await?;
        let replacers = work.replacers(member).await?;
        plans.push((member, channels, replacers));
    }
    for (member, channels, replacers) in plans {
        for channel in channels.intersection(&head_channels) {
            work.delete_entries(package, channel, member).await?;
        }
        if channels.is_subset(&head_channels) && replacers.iter().all(|r| doomed.contains(r.as_str())) {
            work.delete_bundle(member).await?;
            debug!(bundle = %member, "removed bundle below deprecated bundle");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::Database;
    use crate::error::ErrorKind;
    use crate::loader::tests::{bundle, depths};
    use crate::loader::{LoadMode, Loader};
    use opcat_model::PackageManifest;

    async fn names(db: &Database) -> Vec<String> {
        sqlx::query_scalar("SELECT name FROM operatorbundle ORDER BY name").fetch_all(db.pool()).await.unwrap()
    }

    /// `etcd`: alpha (default) is v0.9.0 <- v0.9.2 <- v0.9.4, beta is v0.9.2 <- v0.9.4-beta.
    async fn etcd(db: &Database) -> Loader {
        let loader = Loader::from(db);
        loader
            .add_bundles(&[
                bundle("etcd.v0.9.0", "etcd", (0, 9, 0)),
                bundle("etcd.v0.9.2", "etcd", (0, 9, 2)).with_replaces("etcd.v0.9.0"),
                bundle("etcd.v0.9.4", "etcd", (0, 9, 4)).with_replaces("etcd.v0.9.2"),
                bundle("etcd.v0.9.4-beta", "etcd", (0, 9, 4)).with_replaces("etcd.v0.9.2"),
            ])
            .await
            .unwrap();
        loader
            .add_package_channels(
                &PackageManifest::new("etcd", "alpha")
                    .with_channel("alpha", "etcd.v0.9.4")
                    .with_channel("beta", "etcd.v0.9.4-beta"),
            )
            .await
            .unwrap();
        loader
    }

    #[tokio::test]
    async fn test_deprecate_cuts_tail() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = etcd(&db).await;
        loader.deprecate_bundle("quay.io/etcd:etcd.v0.9.2").await.unwrap();

        // v0.9.0 was only reachable below the deprecated bundle.
        assert_eq!(names(&db).await, vec!["etcd.v0.9.2", "etcd.v0.9.4", "etcd.v0.9.4-beta"]);
        let alpha: Vec<_> = depths(&db, "etcd", "alpha").await.into_iter().map(|e| e.0).collect();
        assert_eq!(alpha, vec!["etcd.v0.9.4", "etcd.v0.9.2"]);
        let beta: Vec<_> = depths(&db, "etcd", "beta").await.into_iter().map(|e| e.0).collect();
        assert_eq!(beta, vec!["etcd.v0.9.4-beta", "etcd.v0.9.2"]);

        let properties: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM properties WHERE type = 'olm.deprecated' AND operatorbundle_name = 'etcd.v0.9.2'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(properties, 1);

        // Reloading the package keeps the graph cut at the deprecated bundle.
        loader
            .add_package_channels(
                &PackageManifest::new("etcd", "alpha")
                    .with_channel("alpha", "etcd.v0.9.4")
                    .with_channel("beta", "etcd.v0.9.4-beta"),
            )
            .await
            .unwrap();
        assert_eq!(depths(&db, "etcd", "alpha").await.len(), 2);
    }

    #[tokio::test]
    async fn test_deprecate_keeps_members_of_other_channels() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = Loader::from(&db);
        loader
            .add_bundles(&[
                bundle("k.v1", "k", (1, 0, 0)),
                bundle("k.v2", "k", (2, 0, 0)).with_replaces("k.v1"),
                bundle("k.v3", "k", (3, 0, 0)).with_replaces("k.v2"),
            ])
            .await
            .unwrap();
        loader
            .add_package_channels(
                &PackageManifest::new("k", "stable").with_channel("stable", "k.v3").with_channel("legacy", "k.v1"),
            )
            .await
            .unwrap();
        loader.deprecate_bundle("quay.io/k:k.v2").await.unwrap();
        assert_eq!(names(&db).await, vec!["k.v1", "k.v2", "k.v3"]);
        assert_eq!(depths(&db, "k", "legacy").await.len(), 1);
        assert!(depths(&db, "k", "stable").await.iter().all(|e| e.0 != "k.v1"));
    }

    #[tokio::test]
    async fn test_deprecate_default_head_is_refused() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = etcd(&db).await;
        let err = loader.deprecate_bundle("quay.io/etcd:etcd.v0.9.4").await.unwrap_err();
        match &*err {
            ErrorKind::RemovingDefaultChannelDuringDeprecation { bundle, package, also_required } => {
                assert_eq!(bundle, "etcd.v0.9.4");
                assert_eq!(package, "etcd");
                assert_eq!(also_required, &vec!["etcd.v0.9.4-beta".to_string()]);
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(names(&db).await.len(), 4);
    }

    #[tokio::test]
    async fn test_deprecate_non_default_head_drops_channel() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = etcd(&db).await;
        loader.deprecate_bundle("quay.io/etcd:etcd.v0.9.4-beta").await.unwrap();
        assert!(depths(&db, "etcd", "beta").await.is_empty());
        assert_eq!(depths(&db, "etcd", "alpha").await.len(), 3);
    }

    #[tokio::test]
    async fn test_deprecate_every_head_removes_package() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = etcd(&db).await;
        loader
            .deprecate_bundles(&["quay.io/etcd:etcd.v0.9.4", "quay.io/etcd:etcd.v0.9.4-beta"])
            .await
            .unwrap();
        let packages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM package").fetch_one(db.pool()).await.unwrap();
        assert_eq!(packages, 0);
        assert!(names(&db).await.is_empty());
        let tombstones: Vec<String> =
            sqlx::query_scalar("SELECT operatorbundle_name FROM deprecated ORDER BY operatorbundle_name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert_eq!(tombstones, vec!["etcd.v0.9.4", "etcd.v0.9.4-beta"]);
    }

    #[tokio::test]
    async fn test_deprecate_default_head_in_batch_names_missing_heads() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = etcd(&db).await.with_mode(LoadMode::Strict);
        let err = loader.deprecate_bundles(&["quay.io/etcd:etcd.v0.9.4"]).await.unwrap_err();
        assert!(matches!(
            &*err,
            ErrorKind::RemovingDefaultChannelDuringDeprecation { also_required, .. } if also_required == &vec!["etcd.v0.9.4-beta".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = etcd(&db).await;
        let err = loader.deprecate_bundle("quay.io/etcd:nope").await.unwrap_err();
        assert!(err.is_not_found());
        let err = loader.deprecate_bundles(&["quay.io/etcd:nope"]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Batch(failures) if failures.len() == 1));
    }

    #[tokio::test]
    async fn test_tombstone_truncates_later_loads() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = etcd(&db).await;
        loader.deprecate_bundle("quay.io/etcd:etcd.v0.9.2").await.unwrap();
        loader.remove_package("etcd").await.unwrap();
        assert!(names(&db).await.is_empty());

        // The row is gone but the tombstone ends the chain instead of failing it.
        loader.add_bundle(&bundle("etcd.v0.9.6", "etcd", (0, 9, 6)).with_replaces("etcd.v0.9.2")).await.unwrap();
        loader
            .add_package_channels(&PackageManifest::new("etcd", "alpha").with_channel("alpha", "etcd.v0.9.6"))
            .await
            .unwrap();
        let alpha: Vec<_> = depths(&db, "etcd", "alpha").await.into_iter().map(|e| e.0).collect();
        assert_eq!(alpha, vec!["etcd.v0.9.6"]);

        // Without a tombstone a missing predecessor is an error.
        loader.add_bundle(&bundle("etcd.v0.9.8", "etcd", (0, 9, 8)).with_replaces("etcd.v0.9.0")).await.unwrap();
        let err = loader
            .add_package_channels(&PackageManifest::new("etcd", "alpha").with_channel("alpha", "etcd.v0.9.8"))
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidChannels { .. }));
    }

    /// `solo` has one channel, `stable`, which is also the default.
    async fn solo(db: &Database) -> Loader {
        let loader = Loader::from(db);
        loader
            .add_bundles(&[bundle("solo.v1", "solo", (1, 0, 0)), bundle("solo.v2", "solo", (2, 0, 0)).with_replaces("solo.v1")])
            .await
            .unwrap();
        loader.add_package_channels(&PackageManifest::new("solo", "stable").with_channel("stable", "solo.v2")).await.unwrap();
        loader
    }

    async fn deprecated_properties(db: &Database, name: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM properties WHERE type = 'olm.deprecated' AND operatorbundle_name = ?1")
            .bind(name)
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_deprecate_only_head_is_refused() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = solo(&db).await;
        let err = loader.deprecate_bundle("quay.io/solo:solo.v2").await.unwrap_err();
        match &*err {
            ErrorKind::RemovingDefaultChannelDuringDeprecation { bundle, package, also_required } => {
                assert_eq!(bundle, "solo.v2");
                assert_eq!(package, "solo");
                assert!(also_required.is_empty(), "no other heads to name");
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(depths(&db, "solo", "stable").await.len(), 2);
        let tombstones: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deprecated").fetch_one(db.pool()).await.unwrap();
        assert_eq!(tombstones, 0);
    }

    #[tokio::test]
    async fn test_deprecate_only_head_in_batch_removes_package() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = solo(&db).await.with_mode(LoadMode::Strict);
        loader.deprecate_bundles(&["quay.io/solo:solo.v2"]).await.unwrap();

        let packages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM package").fetch_one(db.pool()).await.unwrap();
        assert_eq!(packages, 0);
        assert!(names(&db).await.is_empty());
        let tombstones: Vec<String> =
            sqlx::query_scalar("SELECT operatorbundle_name FROM deprecated").fetch_all(db.pool()).await.unwrap();
        assert_eq!(tombstones, vec!["solo.v2"]);

        // Adding the bundle back marks it deprecated again.
        loader.add_bundle(&bundle("solo.v2", "solo", (2, 0, 0)).with_replaces("solo.v1")).await.unwrap();
        assert_eq!(deprecated_properties(&db, "solo.v2").await, 1);
        assert_eq!(deprecated_properties(&db, "solo.v1").await, 0);
    }

    #[tokio::test]
    async fn test_deprecate_several_heads_in_one_package() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = Loader::from(&db).with_mode(LoadMode::Strict);
        loader
            .add_bundles(&[
                bundle("m.v1", "m", (1, 0, 0)),
                bundle("m.v2", "m", (2, 0, 0)).with_replaces("m.v1"),
                bundle("m.v2-beta", "m", (2, 0, 0)).with_replaces("m.v1"),
                bundle("m.v3-alpha", "m", (3, 0, 0)).with_replaces("m.v1"),
            ])
            .await
            .unwrap();
        loader
            .add_package_channels(
                &PackageManifest::new("m", "stable")
                    .with_channel("stable", "m.v2")
                    .with_channel("beta", "m.v2-beta")
                    .with_channel("alpha", "m.v3-alpha"),
            )
            .await
            .unwrap();

        loader.deprecate_bundles(&["quay.io/m:m.v2-beta", "quay.io/m:m.v3-alpha"]).await.unwrap();
        assert!(depths(&db, "m", "beta").await.is_empty());
        assert!(depths(&db, "m", "alpha").await.is_empty());
        let stable: Vec<_> = depths(&db, "m", "stable").await.into_iter().map(|e| e.0).collect();
        assert_eq!(stable, vec!["m.v2", "m.v1"]);
        let channels: Vec<String> =
            sqlx::query_scalar("SELECT name FROM channel WHERE package_name = 'm'").fetch_all(db.pool()).await.unwrap();
        assert_eq!(channels, vec!["stable"]);
        let tombstones: Vec<String> =
            sqlx::query_scalar("SELECT operatorbundle_name FROM deprecated ORDER BY operatorbundle_name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert_eq!(tombstones, vec!["m.v2-beta", "m.v3-alpha"]);
        assert_eq!(deprecated_properties(&db, "m.v2-beta").await, 1);
    }
}
