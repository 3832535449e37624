//! Rebuild in-memory package graphs from stored channel entries.

use crate::Database;
use crate::error::{Error, ErrorKind, Result};
use crate::models::GraphRow;
use exn::{OptionExt, ResultExt};
use opcat_model::graph::{BundleKey, Channel, HeadCandidates, Package};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{instrument, warn};

#[derive(Default)]
struct ChannelBuilder {
    nodes: BTreeMap<BundleKey, BTreeSet<BundleKey>>,
    heads: HeadCandidates,
    /// Keys of bundles stored in the registry, by CSV name. An empty bundle
    /// path is valid here; only a missing bundle row marks a phantom.
    stored: BTreeMap<String, BundleKey>,
}

/// Reads the channel graphs of a package back out of the registry.
#[derive(Debug, Clone)]
pub struct GraphLoader {
    pool: SqlitePool,
}
impl From<&Database> for GraphLoader {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl GraphLoader {
    /// Build the graph of every channel of `package`.
    ///
    /// Fails if any channel has no head or several heads, or if the default
    /// channel is missing.
    #[instrument(skip(self))]
    pub async fn generate(&self, package: &str) -> Result<Package> {
        let (graph, errors) = self.generate_lenient(package).await?;
        if !errors.is_empty() {
            exn::bail!(ErrorKind::InvalidChannels {
                package: package.to_string(),
                errors: errors.iter().map(|(channel, err)| format!("channel {channel}: {}", **err)).collect(),
            });
        }
        if !graph.channels.contains_key(&graph.default_channel) {
            exn::bail!(ErrorKind::NotFound(format!("default channel {} of {package}", graph.default_channel)));
        }
        Ok(graph)
    }

    /// Build what can be built: channels with a structural problem are left
    /// out of the graph and returned next to it, keyed by channel name.
    #[instrument(skip(self))]
    pub async fn generate_lenient(&self, package: &str) -> Result<(Package, BTreeMap<String, Error>)> {
        let default_channel: String = sqlx::query_scalar("SELECT default_channel FROM package WHERE name = ?1")
            .bind(package)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?
            .ok_or_raise(|| ErrorKind::NotFound(format!("package {package}")))?;
        let rows: Vec<GraphRow> = sqlx::query_as(include_str!("../queries/graph_entries.sql"))
            .bind(package)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;

        let mut builders: BTreeMap<String, ChannelBuilder> = BTreeMap::new();
        for row in &rows {
            let builder = builders.entry(row.channel_name.clone()).or_default();
            let key = row.key();
            if row.exists() {
                builder.stored.insert(row.operatorbundle_name.clone(), key.clone());
            }
            let edges = builder.nodes.entry(key).or_default();
            if let Some(replaced) = row.replaces_key() {
                builder.heads.replaced(&replaced.csv_name);
                edges.insert(replaced);
            }
            if row.exists() {
                builder.heads.observe(&row.operatorbundle_name);
            }
        }

        let mut channels = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for (name, builder) in builders {
            let head = match builder.heads.resolve() {
                Ok(head) => head,
                Err(err) => {
                    warn!(channel = %name, error = %*err, "channel has no usable head");
                    errors.insert(name, ErrorKind::graph(err));
                    continue;
                },
            };
            let Some(head) = builder.stored.get(&head).cloned() else {
                errors.insert(name, Error::from(ErrorKind::NotFound(format!("head bundle {head}"))));
                continue;
            };
            channels.insert(name.clone(), Channel { name, head, nodes: builder.nodes });
        }
        Ok((Package { name: package.to_string(), default_channel, channels }, errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::tests::{acme, bundle};

    #[tokio::test]
    async fn test_generate_acme() {
        let db = Database::connect_in_memory().await.unwrap();
        acme(&db).await;
        let package = GraphLoader::from(&db).generate("acme").await.unwrap();
        assert_eq!(package.default_channel, "stable");
        let stable = &package.channels["stable"];
        let v2 = BundleKey::new("acme.v2", "2.0.0", "quay.io/acme:acme.v2");
        let v1 = BundleKey::new("acme.v1", "1.0.0", "quay.io/acme:acme.v1");
        let rc1 = BundleKey::new("acme.v1-rc1", "", "");
        assert_eq!(stable.head, v2);
        assert_eq!(stable.nodes[&v2], BTreeSet::from([v1.clone(), rc1.clone()]));
        assert!(stable.nodes[&v1].is_empty());
        assert!(stable.nodes[&rc1].is_empty());
    }

    #[tokio::test]
    async fn test_unknown_package() {
        let db = Database::connect_in_memory().await.unwrap();
        let err = GraphLoader::from(&db).generate("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_lenient_reports_broken_channel() {
        let db = Database::connect_in_memory().await.unwrap();
        acme(&db).await;
        // A second real bundle nothing replaces makes a second head.
        crate::Loader::from(&db).add_bundle(&bundle("acme.v9", "acme", (9, 0, 0))).await.unwrap();
        sqlx::query("INSERT INTO channel_entry (channel_name, package_name, operatorbundle_name, depth) VALUES ('stable', 'acme', 'acme.v9', 0)")
            .execute(db.pool())
            .await
            .unwrap();
        let loader = GraphLoader::from(&db);
        let (package, errors) = loader.generate_lenient("acme").await.unwrap();
        assert!(package.channels.is_empty());
        assert!(matches!(&*errors["stable"], ErrorKind::Graph(opcat_model::error::ErrorKind::MultipleChannelHeads(_))));
        let err = loader.generate("acme").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidChannels { .. }));
    }

    #[tokio::test]
    async fn test_head_without_bundle_path() {
        let db = Database::connect_in_memory().await.unwrap();
        let loader = crate::Loader::from(&db);
        loader.add_bundle(&opcat_model::Bundle::new("solo.v1", "solo", "")).await.unwrap();
        loader
            .add_package_channels(&opcat_model::PackageManifest::new("solo", "stable").with_channel("stable", "solo.v1"))
            .await
            .unwrap();

        let package = GraphLoader::from(&db).generate("solo").await.unwrap();
        let stable = &package.channels["stable"];
        assert_eq!(stable.head, BundleKey::new("solo.v1", "", ""));
        assert!(stable.nodes[&stable.head].is_empty());
    }
}
