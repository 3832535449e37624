//! The registry's SQLite store and its schema versions.
//!
//! Channel entries, API links and package channels are removed through
//! `ON DELETE CASCADE`, so every connection enforces foreign keys. Schema
//! changes ship as numbered files under `migrations/` and are only ever
//! applied forward.

use exn::ResultExt;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::{ErrorKind, Result};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");
// SQLite has a single writer; extra connections only serve concurrent queries.
const MAX_CONNECTIONS: u32 = 4;
// Deprecating a large package holds the write lock across many statements.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Newest schema version this build knows about.
pub fn latest_schema_version() -> i64 {
    MIGRATOR.iter().map(|m| m.version).max().unwrap_or_default()
}

/// A registry database.
///
/// [`Loader`](crate::Loader), [`GraphLoader`](crate::GraphLoader) and
/// [`SqlQuerier`](crate::SqlQuerier) are all built from a `&Database` and
/// share its pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    fn options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
    }

    async fn with_pool(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(Self { pool })
    }

    /// Open the registry at `path` without touching its schema.
    ///
    /// The file is created if missing. Use [`Database::migrate`] to bring it
    /// up to date, or [`Database::ensure_current`] to refuse an old schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = Self::options().filename(path.as_ref()).create_if_missing(true);
        Self::with_pool(options, MAX_CONNECTIONS).await
    }

    /// Open the registry at `path` and apply pending migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let db = Self::open(path).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// A fresh, migrated registry that lives as long as the pool.
    ///
    /// Available outside `#[cfg(test)]` so that other crates can test against
    /// a real registry.
    pub async fn connect_in_memory() -> Result<Self> {
        // Each connection to ":memory:" opens a separate database.
        let db = Self::with_pool(Self::options().filename(":memory:"), 1).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Highest migration applied to this database, `None` for an empty one.
    pub async fn schema_version(&self) -> Result<Option<i64>> {
        let tracked: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations')",
        )
        .fetch_one(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        if !tracked {
            return Ok(None);
        }
        sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success = 1")
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Apply pending migrations in version order and return the versions
    /// applied by this call.
    ///
    /// Afterwards every stored reference must resolve; a registry with
    /// dangling channel or API links is reported as invalid data.
    #[instrument("migrating registry schema", skip(self))]
    pub async fn migrate(&self) -> Result<Vec<i64>> {
        let before = self.schema_version().await?.unwrap_or_default();
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)?;
        let applied: Vec<i64> = MIGRATOR.iter().map(|m| m.version).filter(|v| *v > before).collect();
        if !applied.is_empty() {
            info!(?applied, "registry schema migrated");
        }

        let dangling: Vec<(String,)> =
            sqlx::query_as("PRAGMA foreign_key_check").fetch_all(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        if let Some((table,)) = dangling.into_iter().next() {
            exn::bail!(ErrorKind::InvalidData(dangling_table(&table)));
        }
        Ok(applied)
    }

    /// Fail unless every known migration has been applied.
    pub async fn ensure_current(&self) -> Result<()> {
        let current = self.schema_version().await?.unwrap_or_default();
        let latest = latest_schema_version();
        if current < latest {
            exn::bail!(ErrorKind::OutdatedSchema { current, latest });
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool once checked-out connections are returned.
    pub async fn close(&self) {
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

fn dangling_table(table: &str) -> &'static str {
    match table {
        "channel" => "dangling channel reference",
        "channel_entry" => "dangling channel entry reference",
        "api_provider" | "api_requirer" => "dangling API link",
        _ => "dangling reference",
    }
}
