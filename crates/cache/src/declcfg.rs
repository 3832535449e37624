//! Declarative catalog metas of one package.
//!
//! A package's metas arrive as a stream of JSON objects (see
//! [`source`](crate::source)). Only three schemas matter to the cache:
//! `olm.package`, `olm.channel` and `olm.bundle`. Anything else is ignored.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use opcat_model::api::Bundle;
use opcat_model::{Api, Property, property};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub(crate) const PACKAGE_SCHEMA: &str = "olm.package";
const CHANNEL_SCHEMA: &str = "olm.channel";
const BUNDLE_SCHEMA: &str = "olm.bundle";
const PACKAGE_REQUIRED: &str = "olm.package.required";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageMeta {
    name: String,
    default_channel: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChannelMeta {
    name: String,
    #[serde(default)]
    entries: Vec<ChannelEntryMeta>,
}

/// One member of a channel, with the edges it declares in that channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChannelEntryMeta {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) replaces: Option<String>,
    #[serde(default)]
    pub(crate) skips: Vec<String>,
    #[serde(default)]
    pub(crate) skip_range: Option<String>,
}
impl ChannelEntryMeta {
    pub(crate) fn replaces(&self) -> Option<&str> {
        self.replaces.as_deref().filter(|r| !r.is_empty())
    }

    pub(crate) fn skips(&self) -> impl Iterator<Item = &str> {
        self.skips.iter().map(String::as_str).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleMeta {
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    properties: Vec<PropertyMeta>,
}

#[derive(Debug, Deserialize)]
struct PropertyMeta {
    #[serde(rename = "type")]
    kind: String,
    value: Value,
}

#[derive(Debug)]
pub(crate) struct DeclarativePackage {
    pub(crate) name: String,
    pub(crate) default_channel: String,
    pub(crate) description: String,
    pub(crate) channels: BTreeMap<String, Vec<ChannelEntryMeta>>,
    bundles: BTreeMap<String, BundleMeta>,
}
impl DeclarativePackage {
    /// Parse the metas of package `name`.
    pub(crate) fn parse(name: &str, metas: &[u8]) -> Result<Self> {
        let mut package: Option<PackageMeta> = None;
        let mut channels = BTreeMap::new();
        let mut bundles = BTreeMap::new();
        let invalid = |reason: String| ErrorKind::InvalidPackage { package: name.to_string(), reason };

        for meta in serde_json::Deserializer::from_slice(metas).into_iter::<Value>() {
            let meta = meta.or_raise(|| ErrorKind::InvalidSource(format!("package {name}")))?;
            let schema = meta.get("schema").and_then(Value::as_str).unwrap_or_default().to_string();
            match schema.as_str() {
                PACKAGE_SCHEMA => {
                    let meta: PackageMeta =
                        serde_json::from_value(meta).or_raise(|| invalid(format!("malformed {schema} meta")))?;
                    if package.replace(meta).is_some() {
                        exn::bail!(invalid(format!("more than one {schema} meta")));
                    }
                },
                CHANNEL_SCHEMA => {
                    let meta: ChannelMeta =
                        serde_json::from_value(meta).or_raise(|| invalid(format!("malformed {schema} meta")))?;
                    if channels.insert(meta.name.clone(), meta.entries).is_some() {
                        exn::bail!(invalid(format!("channel {} declared twice", meta.name)));
                    }
                },
                BUNDLE_SCHEMA => {
                    let meta: BundleMeta =
                        serde_json::from_value(meta).or_raise(|| invalid(format!("malformed {schema} meta")))?;
                    if bundles.contains_key(&meta.name) {
                        exn::bail!(invalid(format!("bundle {} declared twice", meta.name)));
                    }
                    bundles.insert(meta.name.clone(), meta);
                },
                _ => {},
            }
        }

        let Some(package) = package else {
            exn::bail!(invalid(format!("no {PACKAGE_SCHEMA} meta")));
        };
        if package.name != name {
            exn::bail!(invalid(format!("{PACKAGE_SCHEMA} meta is named {}", package.name)));
        }
        Ok(Self {
            name: package.name,
            default_channel: package.default_channel,
            description: package.description,
            channels,
            bundles,
        })
    }

    /// Every channel member as a stored bundle record, in channel then
    /// declaration order.
    pub(crate) fn channel_bundles(&self) -> Result<Vec<Bundle>> {
        let mut out = Vec::new();
        for (channel, entries) in &self.channels {
            for entry in entries {
                out.push(self.bundle(channel, entry)?);
            }
        }
        Ok(out)
    }

    fn bundle(&self, channel: &str, entry: &ChannelEntryMeta) -> Result<Bundle> {
        let meta = self.bundles.get(&entry.name).ok_or_else(|| ErrorKind::InvalidPackage {
            package: self.name.clone(),
            reason: format!("channel {channel} references unknown bundle {}", entry.name),
        })?;
        let mut bundle = Bundle {
            csv_name: meta.name.clone(),
            package_name: self.name.clone(),
            channel_name: channel.to_string(),
            bundle_path: meta.image.clone(),
            skip_range: entry.skip_range.clone().unwrap_or_default(),
            replaces: entry.replaces().unwrap_or_default().to_string(),
            skips: entry.skips().map(str::to_string).collect(),
            ..Default::default()
        };
        for declared in &meta.properties {
            let value = declared.value.to_string();
            let fact = Property::new(&declared.kind, &value);
            match declared.kind.as_str() {
                property::PACKAGE => {
                    let (_, version) = fact.as_package().map_err(|e| self.bad_property(e, &meta.name))?;
                    bundle.version = version;
                    bundle.properties.push(fact);
                },
                property::GVK => {
                    let gvk = fact.as_gvk().map_err(|e| self.bad_property(e, &meta.name))?;
                    bundle.provided_apis.push(Api::new(gvk.group, gvk.version, gvk.kind, ""));
                    bundle.properties.push(fact);
                },
                property::GVK_REQUIRED => {
                    let gvk = fact.as_gvk().map_err(|e| self.bad_property(e, &meta.name))?;
                    bundle.required_apis.push(Api::new(gvk.group, gvk.version, gvk.kind, ""));
                    bundle.dependencies.push(fact);
                },
                PACKAGE_REQUIRED => bundle.dependencies.push(fact),
                property::SUBSTITUTES_FOR => {
                    bundle.substitutes_for = declared.value.as_str().unwrap_or_default().to_string();
                    bundle.properties.push(fact);
                },
                property::BUNDLE_OBJECT => {
                    let data = declared.value.get("data").and_then(Value::as_str).map(str::to_string);
                    bundle.objects.push(data.unwrap_or(value));
                },
                property::CSV_METADATA => bundle.csv_json = value,
                _ => bundle.properties.push(fact),
            }
        }
        Ok(bundle)
    }

    fn bad_property(&self, err: opcat_model::error::Error, bundle: &str) -> crate::error::Error {
        ErrorKind::graph(err).raise(ErrorKind::InvalidPackage {
            package: self.name.clone(),
            reason: format!("bundle {bundle} has an invalid property"),
        })
    }
}
