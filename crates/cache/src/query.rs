//! [`Query`] over a loaded cache.
//!
//! Graph questions are answered from the in-memory [`PackageIndex`]; only
//! full bundle records are read from the backend.

use crate::backend::BackendHandle;
use crate::error::{Error as CacheError, ErrorKind as CacheErrorKind};
use crate::index::{BundleIndex, BundleRef, ChannelIndex, PackageIndex};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use opcat_model::Gvk;
use opcat_model::api::{Bundle, ChannelEntry, PackageSummary};
use opcat_query::error::{Error, ErrorKind, Result};
use opcat_query::{BundleStream, EntryStream, Query};
use std::sync::Arc;
use tracing::instrument;

fn raise(err: CacheError) -> Error {
    let kind = match &*err {
        CacheErrorKind::NotFound(what) => ErrorKind::not_found(what.clone()),
        CacheErrorKind::Encoding(codec) => ErrorKind::InvalidData(format!("stored {codec} record")),
        _ => ErrorKind::Backend,
    };
    err.raise(kind)
}

/// Channel entries of one member: its own entry carrying its `replaces`
/// target (if any), plus one entry per skipped bundle.
fn member_entries(package: &str, channel: &str, bundle: &BundleIndex) -> Vec<ChannelEntry> {
    let mut entries = vec![ChannelEntry::new(package, channel, &bundle.name, bundle.replaces.clone())];
    entries.extend(bundle.skips.iter().map(|s| ChannelEntry::new(package, channel, &bundle.name, Some(s.clone()))));
    entries
}

fn entry_stream<'a>(mut entries: Vec<ChannelEntry>) -> EntryStream<'a> {
    entries.sort();
    entries.dedup();
    Box::pin(stream::iter(entries.into_iter().map(Ok)))
}

/// Answers catalog queries from a built cache.
#[derive(Clone)]
pub struct CacheQuerier {
    backend: BackendHandle,
    index: Arc<PackageIndex>,
}
impl std::fmt::Debug for CacheQuerier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheQuerier").field("backend", &self.backend.name()).finish_non_exhaustive()
    }
}
impl CacheQuerier {
    pub(crate) fn new(backend: BackendHandle, index: Arc<PackageIndex>) -> Self {
        Self { backend, index }
    }

    fn channel(&self, package: &str, channel: &str) -> Result<&ChannelIndex> {
        match self.index.channel(package, channel) {
            Some(channel) => Ok(channel),
            None => exn::bail!(ErrorKind::not_found(format!("channel {package}/{channel}"))),
        }
    }

    /// Every `(package, channel, member)` in the index.
    fn members(&self) -> impl Iterator<Item = (&str, &ChannelIndex, &BundleIndex)> {
        self.index.packages().flat_map(|p| {
            p.channels.values().flat_map(move |c| c.bundles.values().map(move |b| (p.name.as_str(), c, b)))
        })
    }
}

#[async_trait]
impl Query for CacheQuerier {
    async fn list_packages(&self) -> Result<Vec<String>> {
        Ok(self.index.packages().map(|p| p.name.clone()).collect())
    }

    async fn get_package(&self, name: &str) -> Result<PackageSummary> {
        match self.index.get(name) {
            Some(package) => Ok(package.summary()),
            None => exn::bail!(ErrorKind::not_found(format!("package {name}"))),
        }
    }

    #[instrument(skip(self))]
    async fn get_bundle(&self, package: &str, channel: &str, csv_name: &str) -> Result<Bundle> {
        if !self.channel(package, channel)?.bundles.contains_key(csv_name) {
            exn::bail!(ErrorKind::not_found(format!("bundle {csv_name} in {package}/{channel}")));
        }
        self.backend.get_bundle(&BundleRef::new(package, channel, csv_name)).await.map_err(raise)
    }

    #[instrument(skip(self))]
    async fn get_bundle_for_channel(&self, package: &str, channel: &str) -> Result<Bundle> {
        let head = self.channel(package, channel)?.head.clone();
        self.get_bundle(package, channel, &head).await
    }

    #[instrument(skip(self))]
    async fn get_bundle_that_replaces(&self, csv_name: &str, package: &str, channel: &str) -> Result<Bundle> {
        let replacer = self
            .channel(package, channel)?
            .replacers_of(csv_name)
            .min_by(|(a, da), (b, db)| da.cmp(db).then_with(|| a.name.cmp(&b.name)))
            .map(|(b, _)| b.name.clone());
        match replacer {
            Some(replacer) => self.get_bundle(package, channel, &replacer).await,
            None => exn::bail!(ErrorKind::not_found(format!("no bundle replaces {csv_name} in {package}/{channel}"))),
        }
    }

    fn get_channel_entries_that_replace<'a>(&'a self, csv_name: &'a str) -> EntryStream<'a> {
        let entries = self
            .members()
            .flat_map(|(package, channel, bundle)| member_entries(package, &channel.name, bundle))
            .filter(|e| e.replaces.as_deref() == Some(csv_name))
            .collect();
        entry_stream(entries)
    }

    fn get_channel_entries_that_provide<'a>(&'a self, gvk: &'a Gvk) -> EntryStream<'a> {
        let entries = self
            .members()
            .filter(|(_, _, bundle)| bundle.provided_apis.iter().any(|api| api.matches(gvk)))
            .flat_map(|(package, channel, bundle)| member_entries(package, &channel.name, bundle))
            .collect();
        entry_stream(entries)
    }

    fn get_latest_channel_entries_that_provide<'a>(&'a self, gvk: &'a Gvk) -> EntryStream<'a> {
        let entries = self
            .members()
            .filter(|(_, channel, bundle)| channel.head == bundle.name)
            .filter(|(_, _, bundle)| bundle.provided_apis.iter().any(|api| api.matches(gvk)))
            // The shallowest entry of a head is the one carrying its `replaces` edge.
            .map(|(package, channel, bundle)| {
                ChannelEntry::new(package, &channel.name, &bundle.name, bundle.replaces.clone())
            })
            .collect();
        entry_stream(entries)
    }

    fn list_bundles<'a>(&'a self) -> BundleStream<'a> {
        Box::pin(self.backend.send_bundles().map(|bundle| bundle.map(Bundle::trimmed).map_err(raise)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cache;
    use crate::declcfg::tests::ACME;
    use crate::source::SourceCatalog;
    use crate::source::tests::write_catalog;
    use futures::TryStreamExt;

    const BETA: &str = r#"
        {"schema":"olm.package","name":"beta","defaultChannel":"stable"}
        {"schema":"olm.channel","package":"beta","name":"stable","entries":[{"name":"beta.v1"}]}
        {"schema":"olm.channel","package":"beta","name":"edge","entries":[{"name":"beta.v1"},{"name":"beta.v2","replaces":"beta.v1"}]}
        {"schema":"olm.bundle","package":"beta","name":"beta.v1","image":"quay.io/beta:v1","properties":[
            {"type":"olm.package","value":{"packageName":"beta","version":"1.0.0"}},
            {"type":"olm.gvk","value":{"group":"acme.io","kind":"Rocket","version":"v1"}}
        ]}
        {"schema":"olm.bundle","package":"beta","name":"beta.v2","image":"quay.io/beta:v2","properties":[
            {"type":"olm.package","value":{"packageName":"beta","version":"2.0.0"}}
        ]}
    "#;

    async fn querier() -> (tempfile::TempDir, tempfile::TempDir, CacheQuerier) {
        let source = tempfile::tempdir().unwrap();
        write_catalog(source.path(), &[("acme.json", ACME), ("beta/index.json", BETA)]);
        let cache_dir = tempfile::tempdir().unwrap();
        let mut cache = Cache::open(cache_dir.path()).await.unwrap();
        cache.build(&SourceCatalog::new(source.path())).await.unwrap();
        let querier = cache.querier().unwrap();
        (source, cache_dir, querier)
    }

    #[tokio::test]
    async fn test_head_and_replacements() {
        let (_source, _cache, querier) = querier().await;
        assert_eq!(querier.get_bundle_for_channel("acme", "stable").await.unwrap().csv_name, "acme.v2");
        let by_skip = querier.get_bundle_that_replaces("acme.v1-rc1", "acme", "stable").await.unwrap();
        assert_eq!(by_skip.csv_name, "acme.v2");
        let by_replace = querier.get_bundle_that_replaces("acme.v1", "acme", "stable").await.unwrap();
        assert_eq!(by_replace.csv_name, "acme.v2");
        let err = querier.get_bundle_that_replaces("acme.v2", "acme", "stable").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_entries_that_replace() {
        let (_source, _cache, querier) = querier().await;
        let entries: Vec<ChannelEntry> =
            querier.get_channel_entries_that_replace("acme.v1-rc1").try_collect().await.unwrap();
        assert_eq!(entries, vec![ChannelEntry::new("acme", "stable", "acme.v2", Some("acme.v1-rc1".to_string()))]);
    }

    #[tokio::test]
    async fn test_providers() {
        let (_source, _cache, querier) = querier().await;
        let gvk = Gvk::new("acme.io", "v1", "Rocket");
        let latest: Vec<ChannelEntry> =
            querier.get_latest_channel_entries_that_provide(&gvk).try_collect().await.unwrap();
        // beta's edge head (beta.v2) does not provide Rocket, and the older
        // beta.v1 is not looked at.
        assert_eq!(latest, vec![
            ChannelEntry::new("acme", "stable", "acme.v2", Some("acme.v1".to_string())),
            ChannelEntry::new("beta", "stable", "beta.v1", None),
        ]);
        let all: Vec<ChannelEntry> = querier.get_channel_entries_that_provide(&gvk).try_collect().await.unwrap();
        assert_eq!(all.len(), 5);
        let provider = querier.get_bundle_that_provides(&gvk).await.unwrap();
        assert_eq!((provider.package_name.as_str(), provider.csv_name.as_str()), ("acme", "acme.v2"));
    }

    #[tokio::test]
    async fn test_listing() {
        let (_source, _cache, querier) = querier().await;
        assert_eq!(querier.list_packages().await.unwrap(), vec!["acme", "beta"]);
        let beta = querier.get_package("beta").await.unwrap();
        assert_eq!(beta.default_channel, "stable");
        assert_eq!(beta.channels.len(), 2);
        assert!(querier.get_package("gamma").await.unwrap_err().is_not_found());

        let bundles: Vec<Bundle> = querier.list_bundles().try_collect().await.unwrap();
        assert_eq!(bundles.len(), 5);
        assert!(bundles.iter().all(|b| b.csv_json.is_empty() && b.objects.is_empty()));
        let full = querier.get_bundle("acme", "stable", "acme.v2").await.unwrap();
        assert!(!full.objects.is_empty());
    }
}
