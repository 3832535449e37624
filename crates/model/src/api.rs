//! Records returned by catalog queries.

use crate::bundle::{Api, Gvk, Property};
use serde::{Deserialize, Serialize};

/// A bundle as seen from a channel.
///
/// `csv_json` and `objects` carry the full manifests. Listing and streaming
/// queries return [`trimmed`](Self::trimmed) copies without them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bundle {
    pub csv_name: String,
    pub package_name: String,
    pub channel_name: String,
    pub bundle_path: String,
    pub version: String,
    pub skip_range: String,
    pub replaces: String,
    pub skips: Vec<String>,
    pub substitutes_for: String,
    pub provided_apis: Vec<Api>,
    pub required_apis: Vec<Api>,
    pub properties: Vec<Property>,
    pub dependencies: Vec<Property>,
    pub csv_json: String,
    pub objects: Vec<String>,
}
impl Bundle {
    pub fn provides(&self, gvk: &Gvk) -> bool {
        self.provided_apis.iter().any(|api| api.matches(gvk))
    }

    /// Drop the full manifest content, keeping identity and graph fields.
    pub fn trimmed(mut self) -> Self {
        self.csv_json.clear();
        self.objects.clear();
        self
    }
}

/// An edge of a channel graph: `bundle_name` replaces `replaces` in
/// `channel_name` of `package_name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub package_name: String,
    pub channel_name: String,
    pub bundle_name: String,
    pub replaces: Option<String>,
}
impl ChannelEntry {
    pub fn new(
        package_name: impl Into<String>,
        channel_name: impl Into<String>,
        bundle_name: impl Into<String>,
        replaces: Option<String>,
    ) -> Self {
        Self {
            package_name: package_name.into(),
            channel_name: channel_name.into(),
            bundle_name: bundle_name.into(),
            replaces,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub name: String,
    pub head: String,
}

/// A package with its channel heads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSummary {
    pub name: String,
    pub default_channel: String,
    /// Sorted by channel name.
    pub channels: Vec<ChannelSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trimmed_keeps_identity() {
        let bundle = Bundle {
            csv_name: "etcd.v0.9.2".to_string(),
            package_name: "etcd".to_string(),
            channel_name: "alpha".to_string(),
            csv_json: r#"{"kind":"ClusterServiceVersion"}"#.to_string(),
            objects: vec![r#"{"kind":"CustomResourceDefinition"}"#.to_string()],
            provided_apis: vec![Api::new("etcd.database.coreos.com", "v1beta2", "EtcdCluster", "etcdclusters")],
            ..Default::default()
        };
        let trimmed = bundle.clone().trimmed();
        assert!(trimmed.csv_json.is_empty());
        assert!(trimmed.objects.is_empty());
        assert_eq!(trimmed.csv_name, bundle.csv_name);
        assert!(trimmed.provides(&Gvk::new("etcd.database.coreos.com", "v1beta2", "EtcdCluster")));
        assert!(!trimmed.provides(&Gvk::new("etcd.database.coreos.com", "v1beta2", "EtcdBackup")));
    }
}
