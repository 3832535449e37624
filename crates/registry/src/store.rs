//! Typed statements run inside a single transaction.
//!
//! Every mutation of the registry goes through a [`UnitOfWork`] borrowed from
//! an open transaction (or savepoint), so a failure anywhere leaves the store
//! as it was before the operation started.

use crate::error::{ErrorKind, Result};
use crate::models::{BundleRow, EdgeRow};
use exn::ResultExt;
use opcat_model::{Api, Bundle, Gvk, Property};
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};

#[derive(sqlx::FromRow)]
struct PackageEntryRow {
    entry_id: i64,
    channel_name: String,
    operatorbundle_name: String,
    replaces: Option<i64>,
    head_operatorbundle_name: String,
}

pub(crate) struct UnitOfWork<'c> {
    conn: &'c mut SqliteConnection,
}
impl<'c> UnitOfWork<'c> {
    pub(crate) fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub(crate) async fn bundle_exists(&mut self, name: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM operatorbundle WHERE name = ?1)")
            .bind(name)
            .fetch_one(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub(crate) async fn is_deprecated(&mut self, name: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM deprecated WHERE operatorbundle_name = ?1)")
            .bind(name)
            .fetch_one(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// `(replaces, skips)` of a stored bundle, `None` if there is no such bundle.
    pub(crate) async fn edges(&mut self, name: &str) -> Result<Option<(Option<String>, Vec<String>)>> {
        let row: Option<EdgeRow> = sqlx::query_as("SELECT replaces, skips FROM operatorbundle WHERE name = ?1")
            .bind(name)
            .fetch_optional(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        match row {
            Some(row) => {
                let skips = row.skips()?;
                Ok(Some((row.replaces, skips)))
            },
            None => Ok(None),
        }
    }

    /// `(name, version)` of the bundle stored under a bundle path.
    pub(crate) async fn bundle_by_path(&mut self, path: &str) -> Result<Option<(String, String)>> {
        sqlx::query_as("SELECT name, version FROM operatorbundle WHERE bundlepath = ?1 ORDER BY name LIMIT 1")
            .bind(path)
            .fetch_optional(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub(crate) async fn packages_of(&mut self, bundle: &str) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT DISTINCT package_name FROM channel_entry WHERE operatorbundle_name = ?1 ORDER BY package_name",
        )
        .bind(bundle)
        .fetch_all(&mut *self.conn)
        .await
        .or_raise(|| ErrorKind::Database)
    }

    pub(crate) async fn channels_of(&mut self, package: &str, bundle: &str) -> Result<BTreeSet<String>> {
        let channels: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT channel_name FROM channel_entry WHERE package_name = ?1 AND operatorbundle_name = ?2",
        )
        .bind(package)
        .bind(bundle)
        .fetch_all(&mut *self.conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(channels.into_iter().collect())
    }

    /// Channel name to head bundle, for every channel of a package.
    pub(crate) async fn channel_heads(&mut self, package: &str) -> Result<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, head_operatorbundle_name FROM channel WHERE package_name = ?1")
                .bind(package)
                .fetch_all(&mut *self.conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().collect())
    }

    pub(crate) async fn default_channel(&mut self, package: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT default_channel FROM package WHERE name = ?1")
            .bind(package)
            .fetch_optional(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Bundles with an entry (or a row) that replaces or skips `name`.
    pub(crate) async fn replacers(&mut self, name: &str) -> Result<BTreeSet<String>> {
        let names: Vec<String> = sqlx::query_scalar(include_str!("../queries/bundle_replacers.sql"))
            .bind(name)
            .fetch_all(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(names.into_iter().collect())
    }

    // =========================================================================
    // Bundles
    // =========================================================================

    /// Insert a bundle with its images, properties, dependencies and APIs.
    pub(crate) async fn insert_bundle(&mut self, bundle: &Bundle) -> Result<()> {
        let row = BundleRow::try_from(bundle)?;
        sqlx::query(include_str!("../queries/insert_bundle.sql"))
            .bind(&row.name)
            .bind(&row.version)
            .bind(&row.bundlepath)
            .bind(&row.replaces)
            .bind(&row.skips)
            .bind(&row.skiprange)
            .bind(&row.substitutesfor)
            .bind(&row.csv)
            .bind(&row.bundle)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        for image in bundle.related_images.iter().filter(|i| !i.is_empty()) {
            sqlx::query("INSERT OR IGNORE INTO related_image (image, operatorbundle_name) VALUES (?1, ?2)")
                .bind(image)
                .bind(&row.name)
                .execute(&mut *self.conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        for api in bundle.provided_apis.iter().chain(&bundle.required_apis) {
            self.upsert_api(api).await?;
        }
        for property in bundle.effective_properties() {
            self.insert_property(&row.name, &row.version, &row.bundlepath, &property).await?;
        }
        for dependency in bundle.effective_dependencies() {
            if dependency.kind == opcat_model::property::GVK_REQUIRED
                && let Ok(gvk) = dependency.as_gvk()
            {
                self.upsert_gvk(&gvk).await?;
            }
            sqlx::query(include_str!("../queries/insert_dependency.sql"))
                .bind(&dependency.kind)
                .bind(&dependency.value)
                .bind(&row.name)
                .bind(&row.version)
                .bind(&row.bundlepath)
                .execute(&mut *self.conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        Ok(())
    }

    /// Record a property, ignoring exact `(type, value)` duplicates.
    pub(crate) async fn insert_property(
        &mut self,
        bundle: &str,
        version: &str,
        path: &str,
        property: &Property,
    ) -> Result<()> {
        if property.kind == opcat_model::property::GVK
            && let Ok(gvk) = property.as_gvk()
        {
            self.upsert_gvk(&gvk).await?;
        }
        sqlx::query(include_str!("../queries/insert_property.sql"))
            .bind(&property.kind)
            .bind(&property.value)
            .bind(bundle)
            .bind(version)
            .bind(path)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Record an `olm.package` property for a stored bundle.
    pub(crate) async fn record_package(&mut self, bundle: &str, package: &str) -> Result<()> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT version, bundlepath FROM operatorbundle WHERE name = ?1")
                .bind(bundle)
                .fetch_optional(&mut *self.conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        if let Some((version, path)) = row {
            self.insert_property(bundle, &version, &path, &Property::package(package, &version)).await?;
        }
        Ok(())
    }

    async fn upsert_api(&mut self, api: &Api) -> Result<()> {
        sqlx::query(include_str!("../queries/upsert_api.sql"))
            .bind(&api.group)
            .bind(&api.version)
            .bind(&api.kind)
            .bind(&api.plural)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Known GVK without a plural yet.
    async fn upsert_gvk(&mut self, gvk: &Gvk) -> Result<()> {
        self.upsert_api(&Api::new(&gvk.group, &gvk.version, &gvk.kind, "")).await
    }

    pub(crate) async fn delete_bundle(&mut self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM operatorbundle WHERE name = ?1")
            .bind(name)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Cut a bundle loose from everything it replaces or skips.
    pub(crate) async fn truncate(&mut self, name: &str) -> Result<()> {
        sqlx::query("UPDATE channel_entry SET replaces = NULL WHERE operatorbundle_name = ?1")
            .bind(name)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query("UPDATE operatorbundle SET replaces = NULL, skips = '[]' WHERE name = ?1")
            .bind(name)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Write a tombstone and the `olm.deprecated` property (if the row still exists).
    pub(crate) async fn tombstone(&mut self, name: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO deprecated (operatorbundle_name) VALUES (?1)")
            .bind(name)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT version, bundlepath FROM operatorbundle WHERE name = ?1")
                .bind(name)
                .fetch_optional(&mut *self.conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        if let Some((version, path)) = row {
            self.insert_property(name, &version, &path, &Property::deprecated()).await?;
        }
        Ok(())
    }

    pub(crate) async fn remove_stranded(&mut self) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/remove_stranded_bundles.sql"))
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Packages and channels
    // =========================================================================

    pub(crate) async fn upsert_package(&mut self, name: &str, default_channel: &str) -> Result<()> {
        sqlx::query(include_str!("../queries/upsert_package.sql"))
            .bind(name)
            .bind(default_channel)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Drop every channel of a package (entries and API links cascade).
    pub(crate) async fn delete_channels(&mut self, package: &str) -> Result<()> {
        sqlx::query("DELETE FROM channel WHERE package_name = ?1")
            .bind(package)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Delete a package and the bundles that were only reachable through it.
    ///
    /// Returns `false` if there was no such package.
    pub(crate) async fn delete_package(&mut self, name: &str) -> Result<bool> {
        let members: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT operatorbundle_name FROM channel_entry WHERE package_name = ?1")
                .bind(name)
                .fetch_all(&mut *self.conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        let result = sqlx::query("DELETE FROM package WHERE name = ?1")
            .bind(name)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        for member in members {
            sqlx::query(
                "DELETE FROM operatorbundle WHERE name = ?1 AND NOT EXISTS (SELECT 1 FROM channel_entry WHERE operatorbundle_name = ?1)",
            )
            .bind(&member)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        }
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn insert_channel(&mut self, package: &str, channel: &str, head: &str) -> Result<()> {
        sqlx::query("INSERT INTO channel (name, package_name, head_operatorbundle_name) VALUES (?1, ?2, ?3)")
            .bind(channel)
            .bind(package)
            .bind(head)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Drop channels headed by `head` that have no other members left.
    pub(crate) async fn drop_channels_headed_by(&mut self, package: &str, head: &str) -> Result<u64> {
        let result = sqlx::query(include_str!("../queries/drop_deprecated_channels.sql"))
            .bind(package)
            .bind(head)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Channel entries
    // =========================================================================

    pub(crate) async fn insert_entry(&mut self, package: &str, channel: &str, bundle: &str, depth: u32) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO channel_entry (channel_name, package_name, operatorbundle_name, depth) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(channel)
        .bind(package)
        .bind(bundle)
        .bind(i64::from(depth))
        .execute(&mut *self.conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Ok(result.last_insert_rowid())
    }

    pub(crate) async fn set_replaces(&mut self, entry: i64, replaces: i64) -> Result<()> {
        sqlx::query("UPDATE channel_entry SET replaces = ?1 WHERE entry_id = ?2")
            .bind(replaces)
            .bind(entry)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Point the provider/requirer tables at an entry of a stored bundle.
    pub(crate) async fn link_apis(&mut self, entry: i64, bundle: &str) -> Result<()> {
        for statement in [include_str!("../queries/link_provided_apis.sql"), include_str!("../queries/link_required_apis.sql")] {
            sqlx::query(statement)
                .bind(bundle)
                .bind(entry)
                .execute(&mut *self.conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        Ok(())
    }

    pub(crate) async fn delete_entries(&mut self, package: &str, channel: &str, bundle: &str) -> Result<()> {
        sqlx::query("DELETE FROM channel_entry WHERE package_name = ?1 AND channel_name = ?2 AND operatorbundle_name = ?3")
            .bind(package)
            .bind(channel)
            .bind(bundle)
            .execute(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Delete entries of a package that can no longer be reached from their
    /// channel's head.
    ///
    /// An entry is reachable if it belongs to the head bundle, if a reachable
    /// entry replaces it, or if another entry of the same bundle in the same
    /// channel is reachable. Returns the number of entries deleted.
    pub(crate) async fn prune_unreachable_entries(&mut self, package: &str) -> Result<u64> {
        let rows: Vec<PackageEntryRow> = sqlx::query_as(include_str!("../queries/package_entries.sql"))
            .bind(package)
            .fetch_all(&mut *self.conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let unreachable = unreachable_entries(&rows);
        for entry in &unreachable {
            sqlx::query("DELETE FROM channel_entry WHERE entry_id = ?1")
                .bind(entry)
                .execute(&mut *self.conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        Ok(unreachable.len() as u64)
    }
}

fn unreachable_entries(rows: &[PackageEntryRow]) -> Vec<i64> {
    let by_id: BTreeMap<i64, &PackageEntryRow> = rows.iter().map(|r| (r.entry_id, r)).collect();
    let mut by_bundle: BTreeMap<(&str, &str), Vec<i64>> = BTreeMap::new();
    for row in rows {
        by_bundle.entry((row.channel_name.as_str(), row.operatorbundle_name.as_str())).or_default().push(row.entry_id);
    }
    let mut reached = BTreeSet::new();
    let mut stack: Vec<i64> = rows
        .iter()
        .filter(|r| r.operatorbundle_name == r.head_operatorbundle_name)
        .map(|r| r.entry_id)
        .collect();
    while let Some(id) = stack.pop() {
        if !reached.insert(id) {
            continue;
        }
        let Some(row) = by_id.get(&id) else { continue };
        if let Some(replaces) = row.replaces {
            stack.push(replaces);
        }
        if let Some(siblings) = by_bundle.get(&(row.channel_name.as_str(), row.operatorbundle_name.as_str())) {
            stack.extend(siblings.iter().copied());
        }
    }
    rows.iter().map(|r| r.entry_id).filter(|id| !reached.contains(id)).collect()
}
