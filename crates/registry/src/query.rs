//! [`Query`] over the relational registry.

use crate::Database;
use crate::models::{BundleRow, EntryRow};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use futures::StreamExt;
use opcat_model::api::{Bundle, ChannelEntry, ChannelSummary, PackageSummary};
use opcat_model::{Api, Gvk, Property};
use opcat_query::error::{ErrorKind, Result};
use opcat_query::{BundleStream, EntryStream, Query};
use sqlx::SqlitePool;
use tracing::instrument;

type ApiRow = (String, String, String, String);

#[derive(Debug, Clone)]
pub struct SqlQuerier {
    pool: SqlitePool,
}
impl From<&Database> for SqlQuerier {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl SqlQuerier {
    fn entries<'a>(&'a self, query: sqlx::query::QueryAs<'a, sqlx::Sqlite, EntryRow, sqlx::sqlite::SqliteArguments<'a>>) -> EntryStream<'a> {
        Box::pin(
            query
                .fetch(&self.pool)
                .map(|row| row.map(ChannelEntry::from).or_raise(|| ErrorKind::Backend)),
        )
    }

    /// Fill in the parts of a bundle stored outside its row.
    async fn hydrate(&self, mut bundle: Bundle) -> Result<Bundle> {
        let name = bundle.csv_name.as_str();
        bundle.properties = self.properties("SELECT type, value FROM properties WHERE operatorbundle_name = ?1 ORDER BY rowid", name).await?;
        bundle.dependencies =
            self.properties("SELECT type, value FROM dependencies WHERE operatorbundle_name = ?1 ORDER BY rowid", name).await?;
        bundle.provided_apis = self.apis(include_str!("../queries/bundle_provided_apis.sql"), name).await?;
        bundle.required_apis = self.apis(include_str!("../queries/bundle_required_apis.sql"), name).await?;
        Ok(bundle)
    }

    async fn properties(&self, sql: &'static str, bundle: &str) -> Result<Vec<Property>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as(sql).bind(bundle).fetch_all(&self.pool).await.or_raise(|| ErrorKind::Backend)?;
        Ok(rows.into_iter().map(|(kind, value)| Property::new(kind, value)).collect())
    }

    async fn apis(&self, sql: &'static str, bundle: &str) -> Result<Vec<Api>> {
        let rows: Vec<ApiRow> =
            sqlx::query_as(sql).bind(bundle).fetch_all(&self.pool).await.or_raise(|| ErrorKind::Backend)?;
        Ok(rows.into_iter().map(|(group, version, kind, plural)| Api::new(group, version, kind, plural)).collect())
    }
}

#[async_trait]
impl Query for SqlQuerier {
    async fn list_packages(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT name FROM package ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)
    }

    #[instrument(skip(self))]
    async fn get_package(&self, name: &str) -> Result<PackageSummary> {
        let default_channel: String = sqlx::query_scalar("SELECT default_channel FROM package WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?
            .ok_or_raise(|| ErrorKind::not_found(format!("package {name}")))?;
        let channels: Vec<(String, String)> = sqlx::query_as(
            "SELECT name, head_operatorbundle_name FROM channel WHERE package_name = ?1 ORDER BY name",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .or_raise(|| ErrorKind::Backend)?;
        Ok(PackageSummary {
            name: name.to_string(),
            default_channel,
            channels: channels.into_iter().map(|(name, head)| ChannelSummary { name, head }).collect(),
        })
    }

    #[instrument(skip(self))]
    async fn get_bundle(&self, package: &str, channel: &str, csv_name: &str) -> Result<Bundle> {
        let row: BundleRow = sqlx::query_as(include_str!("../queries/get_bundle_in_channel.sql"))
            .bind(package)
            .bind(channel)
            .bind(csv_name)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?
            .ok_or_raise(|| ErrorKind::not_found(format!("bundle {csv_name} in {package}/{channel}")))?;
        let bundle = row
            .into_api(package, channel)
            .map_err(|err| err.raise(ErrorKind::InvalidData(format!("bundle {csv_name}"))))?;
        self.hydrate(bundle).await
    }

    #[instrument(skip(self))]
    async fn get_bundle_for_channel(&self, package: &str, channel: &str) -> Result<Bundle> {
        let head: String = sqlx::query_scalar(
            "SELECT head_operatorbundle_name FROM channel WHERE package_name = ?1 AND name = ?2",
        )
        .bind(package)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await
        .or_raise(|| ErrorKind::Backend)?
        .ok_or_raise(|| ErrorKind::not_found(format!("channel {package}/{channel}")))?;
        self.get_bundle(package, channel, &head).await
    }

    #[instrument(skip(self))]
    async fn get_bundle_that_replaces(&self, csv_name: &str, package: &str, channel: &str) -> Result<Bundle> {
        let replacer: String = sqlx::query_scalar(include_str!("../queries/bundle_that_replaces.sql"))
            .bind(csv_name)
            .bind(package)
            .bind(channel)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Backend)?
            .ok_or_raise(|| ErrorKind::not_found(format!("no bundle replaces {csv_name} in {package}/{channel}")))?;
        self.get_bundle(package, channel, &replacer).await
    }

    fn get_channel_entries_that_replace<'a>(&'a self, csv_name: &'a str) -> EntryStream<'a> {
        self.entries(sqlx::query_as(include_str!("../queries/entries_that_replace.sql")).bind(csv_name))
    }

    fn get_channel_entries_that_provide<'a>(&'a self, gvk: &'a Gvk) -> EntryStream<'a> {
        self.entries(
            sqlx::query_as(include_str!("../queries/entries_that_provide.sql"))
                .bind(&gvk.group)
                .bind(&gvk.version)
                .bind(&gvk.kind),
        )
    }

    fn get_latest_channel_entries_that_provide<'a>(&'a self, gvk: &'a Gvk) -> EntryStream<'a> {
        self.entries(
            sqlx::query_as(include_str!("../queries/latest_entries_that_provide.sql"))
                .bind(&gvk.group)
                .bind(&gvk.version)
                .bind(&gvk.kind),
        )
    }

    fn list_bundles<'a>(&'a self) -> BundleStream<'a> {
        Box::pin(async_stream::stream! {
            let members: Vec<(String, String, String)> = match sqlx::query_as(include_str!("../queries/list_members.sql"))
                .fetch_all(&self.pool)
                .await
                .or_raise(|| ErrorKind::Backend)
            {
                Ok(members) => members,
                Err(err) => {
                    yield Err(err);
                    return;
                },
            };
            for (package, channel, name) in members {
                match self.get_bundle(&package, &channel, &name).await {
                    Ok(bundle) => yield Ok(bundle.trimmed()),
                    Err(err) => {
                        yield Err(err);
                        return;
                    },
                }
            }
        })
    }
}
