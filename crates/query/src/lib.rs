//! Query surface over an operator catalog.
//!
//! [`Query`] is the contract every store answers: the relational registry and
//! the on-disk cache both implement it with the same graph semantics, so a
//! transport layer (RPC server, CLI) can sit on top of either.
//!
//! Single-record methods fail with [`ErrorKind::NotFound`] when nothing
//! matches. Streaming methods yield records in a stable order and end at the
//! first error.

pub mod error;

use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use opcat_model::Gvk;
use opcat_model::api::{Bundle, ChannelEntry, PackageSummary};
use std::collections::BTreeMap;
use std::pin::Pin;

pub type BundleStream<'a> = Pin<Box<dyn Stream<Item = Result<Bundle>> + Send + 'a>>;
pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = Result<ChannelEntry>> + Send + 'a>>;

/// Read-only catalog queries.
///
/// "Replaces" answers include entries synthesized for skipped bundles: a
/// bundle that only skipped `X` is still reported as replacing `X`.
///
/// # Examples
///
/// ```no_run
/// use futures::TryStreamExt;
/// use opcat_query::{Query, error::Result};
///
/// async fn upgrade_path(query: &dyn Query, from: &str) -> Result<Vec<String>> {
///     let entries: Vec<_> = query.get_channel_entries_that_replace(from).try_collect().await?;
///     Ok(entries.into_iter().map(|e| e.bundle_name).collect())
/// }
/// ```
#[async_trait]
pub trait Query: Send + Sync {
    /// Names of every package, sorted.
    async fn list_packages(&self) -> Result<Vec<String>>;

    /// Default channel and channel heads of a package.
    async fn get_package(&self, name: &str) -> Result<PackageSummary>;

    /// A bundle by CSV name, as a member of the given channel.
    async fn get_bundle(&self, package: &str, channel: &str, csv_name: &str) -> Result<Bundle>;

    /// The head of a channel.
    async fn get_bundle_for_channel(&self, package: &str, channel: &str) -> Result<Bundle>;

    /// The bundle in a channel that replaces (or skips) `csv_name`.
    async fn get_bundle_that_replaces(&self, csv_name: &str, package: &str, channel: &str) -> Result<Bundle>;

    /// Every channel entry, in any package, that replaces (or skips) `csv_name`.
    fn get_channel_entries_that_replace<'a>(&'a self, csv_name: &'a str) -> EntryStream<'a>;

    /// Every channel entry whose bundle provides `gvk`.
    fn get_channel_entries_that_provide<'a>(&'a self, gvk: &'a Gvk) -> EntryStream<'a>;

    /// Channel heads that provide `gvk`, one entry per channel.
    ///
    /// Only heads are considered: a channel whose head does not provide the
    /// API contributes nothing even if an older member does. When a head has
    /// several entries (synthesized skip entries) the shallowest one wins.
    fn get_latest_channel_entries_that_provide<'a>(&'a self, gvk: &'a Gvk) -> EntryStream<'a>;

    /// Every bundle in the catalog with manifest content trimmed.
    fn list_bundles<'a>(&'a self) -> BundleStream<'a>;

    /// The single bundle that should satisfy a requirement on `gvk`.
    ///
    /// Candidates are the latest providers sitting on their package's default
    /// channel. Ties between packages go to the lexically smallest package name.
    async fn get_bundle_that_provides(&self, gvk: &Gvk) -> Result<Bundle> {
        let entries: Vec<ChannelEntry> = self.get_latest_channel_entries_that_provide(gvk).try_collect().await?;
        let mut defaults = BTreeMap::new();
        for entry in &entries {
            if !defaults.contains_key(&entry.package_name) {
                let package = self.get_package(&entry.package_name).await?;
                defaults.insert(entry.package_name.clone(), package.default_channel);
            }
        }
        match choose_provider(entries, &defaults) {
            Some(entry) => self.get_bundle(&entry.package_name, &entry.channel_name, &entry.bundle_name).await,
            None => exn::bail!(ErrorKind::not_found(format!("no bundle provides {gvk}"))),
        }
    }
}

/// Pick the provider on a default channel with the smallest package name
/// (then channel, then bundle name).
pub fn choose_provider(
    entries: impl IntoIterator<Item = ChannelEntry>,
    default_channels: &BTreeMap<String, String>,
) -> Option<ChannelEntry> {
    entries
        .into_iter()
        .filter(|e| default_channels.get(&e.package_name).is_some_and(|d| *d == e.channel_name))
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use opcat_model::Api;
    use opcat_model::api::ChannelSummary;

    /// Just enough of a catalog to exercise the provided methods.
    struct Fixture {
        heads: Vec<(Bundle, String)>,
    }
    impl Fixture {
        fn new() -> Self {
            let api = Api::new("cache.example.com", "v1", "Memcached", "memcacheds");
            let bundle = |package: &str, channel: &str, name: &str| Bundle {
                csv_name: name.to_string(),
                package_name: package.to_string(),
                channel_name: channel.to_string(),
                provided_apis: vec![api.clone()],
                ..Default::default()
            };
            Self {
                heads: vec![
                    (bundle("zeta", "stable", "zeta.v1"), "stable".to_string()),
                    (bundle("alpha", "beta", "alpha.v2"), "stable".to_string()),
                    (bundle("beta", "stable", "beta.v3"), "stable".to_string()),
                ],
            }
        }
    }

    #[async_trait]
    impl Query for Fixture {
        async fn list_packages(&self) -> Result<Vec<String>> {
            Ok(self.heads.iter().map(|(b, _)| b.package_name.clone()).collect())
        }

        async fn get_package(&self, name: &str) -> Result<PackageSummary> {
            let (bundle, default_channel) = self
                .heads
                .iter()
                .find(|(b, _)| b.package_name == name)
                .ok_or_else(|| ErrorKind::not_found(name))?;
            Ok(PackageSummary {
                name: name.to_string(),
                default_channel: default_channel.clone(),
                channels: vec![ChannelSummary { name: bundle.channel_name.clone(), head: bundle.csv_name.clone() }],
            })
        }

        async fn get_bundle(&self, package: &str, channel: &str, csv_name: &str) -> Result<Bundle> {
            let found = self.heads.iter().map(|(b, _)| b).find(|b| {
                b.package_name == package && b.channel_name == channel && b.csv_name == csv_name
            });
            Ok(found.cloned().ok_or_else(|| ErrorKind::not_found(csv_name))?)
        }

        async fn get_bundle_for_channel(&self, _package: &str, _channel: &str) -> Result<Bundle> {
            unimplemented!()
        }

        async fn get_bundle_that_replaces(&self, _name: &str, _package: &str, _channel: &str) -> Result<Bundle> {
            unimplemented!()
        }

        fn get_channel_entries_that_replace<'a>(&'a self, _name: &'a str) -> EntryStream<'a> {
            Box::pin(stream::empty())
        }

        fn get_channel_entries_that_provide<'a>(&'a self, gvk: &'a Gvk) -> EntryStream<'a> {
            self.get_latest_channel_entries_that_provide(gvk)
        }

        fn get_latest_channel_entries_that_provide<'a>(&'a self, gvk: &'a Gvk) -> EntryStream<'a> {
            let entries: Vec<Result<ChannelEntry>> = self
                .heads
                .iter()
                .filter(|(b, _)| b.provides(gvk))
                .map(|(b, _)| Ok(ChannelEntry::new(&b.package_name, &b.channel_name, &b.csv_name, None)))
                .collect();
            Box::pin(stream::iter(entries))
        }

        fn list_bundles<'a>(&'a self) -> BundleStream<'a> {
            Box::pin(stream::iter(self.heads.iter().map(|(b, _)| Ok(b.clone().trimmed())).collect::<Vec<_>>()))
        }
    }

    #[tokio::test]
    async fn test_provider_on_default_channel_by_package_name() {
        let fixture = Fixture::new();
        let gvk = Gvk::new("cache.example.com", "v1", "Memcached");
        // "alpha" sorts first but only provides from a non-default channel.
        let bundle = fixture.get_bundle_that_provides(&gvk).await.unwrap();
        assert_eq!(bundle.csv_name, "beta.v3");
    }

    #[tokio::test]
    async fn test_no_provider_is_not_found() {
        let fixture = Fixture::new();
        let gvk = Gvk::new("cache.example.com", "v1", "Redis");
        let err = fixture.get_bundle_that_provides(&gvk).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[rstest::rstest]
    #[case::unknown_package_ignored(&[("a", "stable", "a.v1"), ("b", "stable", "b.v2"), ("b", "stable", "b.v1")], Some("b.v1"))]
    #[case::off_default_channel(&[("b", "candidate", "b.v9")], None)]
    #[case::smallest_package_wins(&[("c", "stable", "c.v1"), ("b", "stable", "b.v3")], Some("b.v3"))]
    fn test_choose_provider(#[case] entries: &[(&str, &str, &str)], #[case] expected: Option<&str>) {
        let defaults = BTreeMap::from([
            ("b".to_string(), "stable".to_string()),
            ("c".to_string(), "stable".to_string()),
        ]);
        let entries = entries.iter().map(|(p, c, b)| ChannelEntry::new(*p, *c, *b, None));
        let chosen = choose_provider(entries, &defaults);
        assert_eq!(chosen.as_ref().map(|e| e.bundle_name.as_str()), expected);
    }
}
