//! In-memory package index.
//!
//! The index is everything the cache needs to answer graph queries without
//! touching stored bundles: channel heads, replacement edges, depths and the
//! APIs each member provides. Full bundle records stay in the backend.

use crate::declcfg::DeclarativePackage;
use crate::error::{ErrorKind, Result};
use opcat_model::Api;
use opcat_model::api::{ChannelSummary, PackageSummary};
use opcat_model::graph::{HeadCandidates, assign_depths};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Location of one stored bundle record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BundleRef {
    pub package: String,
    pub channel: String,
    pub name: String,
}
impl BundleRef {
    pub fn new(package: impl Into<String>, channel: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            channel: channel.into(),
            name: name.into(),
        }
    }
}
impl fmt::Display for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.package, self.channel, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleIndex {
    pub name: String,
    pub replaces: Option<String>,
    pub skips: Vec<String>,
    /// Distance from the channel head.
    pub depth: u32,
    pub provided_apis: Vec<Api>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIndex {
    pub name: String,
    pub head: String,
    pub bundles: BTreeMap<String, BundleIndex>,
}
impl ChannelIndex {
    /// Members with an edge to `target`: `(member, depth of the edge)`.
    ///
    /// A `replaces` edge counts at the member's depth, a `skips` edge one
    /// deeper, so a replacement wins over a skip from the same depth.
    pub fn replacers_of<'a>(&'a self, target: &'a str) -> impl Iterator<Item = (&'a BundleIndex, u32)> + 'a {
        self.bundles.values().filter_map(move |b| {
            if b.replaces.as_deref() == Some(target) {
                Some((b, b.depth))
            } else if b.skips.iter().any(|s| s == target) {
                Some((b, b.depth + 1))
            } else {
                None
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageIndexEntry {
    pub name: String,
    pub description: String,
    pub default_channel: String,
    pub channels: BTreeMap<String, ChannelIndex>,
}
impl PackageIndexEntry {
    /// Index a parsed package, validating every channel graph.
    pub(crate) fn build(package: &DeclarativePackage) -> Result<Self> {
        let invalid = |reason: String| ErrorKind::InvalidPackage { package: package.name.clone(), reason };
        if !package.channels.contains_key(&package.default_channel) {
            exn::bail!(invalid(format!("default channel {} is not declared", package.default_channel)));
        }

        let provided = package.channel_bundles()?.into_iter().fold(BTreeMap::new(), |mut acc, b| {
            acc.entry(b.csv_name).or_insert(b.provided_apis);
            acc
        });

        let mut channels = BTreeMap::new();
        for (name, entries) in &package.channels {
            let by_name: BTreeMap<&str, _> = entries.iter().map(|e| (e.name.as_str(), e)).collect();
            let mut heads = HeadCandidates::default();
            for entry in entries {
                heads.observe(&entry.name);
            }
            for entry in entries {
                entry.replaces().into_iter().chain(entry.skips()).for_each(|target| heads.replaced(target));
            }
            let head = heads
                .resolve()
                .map_err(|e| ErrorKind::graph(e).raise(invalid(format!("channel {name}"))))?;
            let depths = assign_depths(&head, |member| {
                by_name.get(member).copied().map(|e| (e.replaces(), e.skips.as_slice()))
            })
            .map_err(|e| ErrorKind::graph(e).raise(invalid(format!("channel {name}"))))?;

            let unreachable: Vec<&str> =
                by_name.keys().copied().filter(|member| !depths.contains_key(*member)).collect();
            if !unreachable.is_empty() {
                exn::bail!(invalid(format!(
                    "channel {name}: not reachable from head {head}: {}",
                    unreachable.join(", ")
                )));
            }

            let bundles = entries
                .iter()
                .map(|e| {
                    let index = BundleIndex {
                        name: e.name.clone(),
                        replaces: e.replaces().map(str::to_string),
                        skips: e.skips().map(str::to_string).collect(),
                        depth: depths[&e.name],
                        provided_apis: provided.get(&e.name).cloned().unwrap_or_default(),
                    };
                    (e.name.clone(), index)
                })
                .collect();
            channels.insert(name.clone(), ChannelIndex { name: name.clone(), head, bundles });
        }

        Ok(Self {
            name: package.name.clone(),
            description: package.description.clone(),
            default_channel: package.default_channel.clone(),
            channels,
        })
    }

    pub fn summary(&self) -> PackageSummary {
        PackageSummary {
            name: self.name.clone(),
            default_channel: self.default_channel.clone(),
            channels: self
                .channels
                .values()
                .map(|c| ChannelSummary { name: c.name.clone(), head: c.head.clone() })
                .collect(),
        }
    }
}

/// Every package of a built cache, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageIndex(BTreeMap<String, PackageIndexEntry>);
impl PackageIndex {
    pub fn get(&self, package: &str) -> Option<&PackageIndexEntry> {
        self.0.get(package)
    }

    pub fn channel(&self, package: &str, channel: &str) -> Option<&ChannelIndex> {
        self.get(package).and_then(|p| p.channels.get(channel))
    }

    pub fn insert(&mut self, entry: PackageIndexEntry) {
        self.0.insert(entry.name.clone(), entry);
    }

    pub fn packages(&self) -> impl Iterator<Item = &PackageIndexEntry> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every stored bundle record, in key order.
    pub fn bundle_refs(&self) -> impl Iterator<Item = BundleRef> + '_ {
        self.packages().flat_map(|p| {
            p.channels.values().flat_map(move |c| {
                c.bundles.keys().map(move |b| BundleRef::new(&p.name, &c.name, b))
            })
        })
    }
}
