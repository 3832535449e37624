use serde::{Deserialize, Serialize};

/// A channel declared by a package manifest, identified by its head bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageChannel {
    pub name: String,
    #[serde(rename = "currentCSV")]
    pub current_csv_name: String,
}

/// Channel layout of a package: which bundle heads each channel, and which
/// channel is the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub package_name: String,
    pub channels: Vec<PackageChannel>,
    pub default_channel_name: String,
}
impl PackageManifest {
    pub fn new(package_name: impl Into<String>, default_channel_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            channels: Vec::new(),
            default_channel_name: default_channel_name.into(),
        }
    }

    pub fn with_channel(mut self, name: impl Into<String>, head: impl Into<String>) -> Self {
        self.channels.push(PackageChannel { name: name.into(), current_csv_name: head.into() });
        self
    }

    pub fn channel(&self, name: &str) -> Option<&PackageChannel> {
        self.channels.iter().find(|c| c.name == name)
    }
}
