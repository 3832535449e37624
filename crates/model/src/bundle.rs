use crate::error::{ErrorKind, Result};
use derive_more::Display;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Well-known property types.
pub mod property {
    pub const PACKAGE: &str = "olm.package";
    pub const GVK: &str = "olm.gvk";
    pub const GVK_REQUIRED: &str = "olm.gvk.required";
    pub const DEPRECATED: &str = "olm.deprecated";
    pub const SUBSTITUTES_FOR: &str = "olm.substitutesFor";
    pub const BUNDLE_OBJECT: &str = "olm.bundle.object";
    pub const CSV_METADATA: &str = "olm.csv.metadata";
}

/// Group/Version/Kind of an API, used as a query key.
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[display("{group}/{version}/{kind}")]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}
impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }
}

/// An API provided or required by a bundle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Api {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}
impl Api {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
        }
    }

    pub fn gvk(&self) -> Gvk {
        Gvk::new(&self.group, &self.version, &self.kind)
    }

    pub fn matches(&self, gvk: &Gvk) -> bool {
        self.group == gvk.group && self.version == gvk.version && self.kind == gvk.kind
    }
}

/// A typed fact about a bundle. The value is kept as JSON text so it can be
/// stored and compared verbatim by every backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Property {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}
impl Property {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self { kind: kind.into(), value: value.into() }
    }

    /// `olm.package` property recording which package (and version) a bundle
    /// belongs to.
    pub fn package(name: &str, version: &str) -> Self {
        Self::new(property::PACKAGE, json!({"packageName": name, "version": version}).to_string())
    }

    pub fn gvk(gvk: &Gvk) -> Self {
        Self::new(property::GVK, Self::gvk_value(gvk))
    }

    pub fn gvk_required(gvk: &Gvk) -> Self {
        Self::new(property::GVK_REQUIRED, Self::gvk_value(gvk))
    }

    pub fn deprecated() -> Self {
        Self::new(property::DEPRECATED, "{}")
    }

    pub fn substitutes_for(name: &str) -> Self {
        Self::new(property::SUBSTITUTES_FOR, json!(name).to_string())
    }

    fn gvk_value(gvk: &Gvk) -> String {
        json!({"group": gvk.group, "kind": gvk.kind, "version": gvk.version}).to_string()
    }

    /// Decode a GVK-shaped value (`olm.gvk` and `olm.gvk.required`).
    pub fn as_gvk(&self) -> Result<Gvk> {
        match serde_json::from_str::<Gvk>(&self.value) {
            Ok(gvk) => Ok(gvk),
            Err(_) => exn::bail!(ErrorKind::InvalidProperty {
                kind: self.kind.clone(),
                value: self.value.clone(),
            }),
        }
    }

    /// Decode an `olm.package` value into `(package name, version)`.
    pub fn as_package(&self) -> Result<(String, String)> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PackageValue {
            package_name: String,
            #[serde(default)]
            version: String,
        }
        match serde_json::from_str::<PackageValue>(&self.value) {
            Ok(v) => Ok((v.package_name, v.version)),
            Err(_) => exn::bail!(ErrorKind::InvalidProperty {
                kind: self.kind.clone(),
                value: self.value.clone(),
            }),
        }
    }
}

/// An immutable release unit of an operator package.
///
/// Only `name` and `package` are needed when decoding; every other field
/// defaults to empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Bundle {
    /// Unique bundle (CSV) name.
    pub name: String,
    pub package: String,
    pub version: Option<Version>,
    /// Content locator, usually an image reference.
    pub bundle_path: String,
    /// Direct predecessor.
    pub replaces: Option<String>,
    /// Additional predecessors superseded without being the direct replace target.
    pub skips: Vec<String>,
    pub skip_range: Option<String>,
    /// Alpha feature: marks this bundle as a drop-in replacement for another.
    pub substitutes_for: Option<String>,
    pub provided_apis: Vec<Api>,
    pub required_apis: Vec<Api>,
    pub properties: Vec<Property>,
    pub dependencies: Vec<Property>,
    pub related_images: Vec<String>,
    /// Full CSV manifest, if known.
    pub csv_json: Option<String>,
    /// Every other manifest shipped in the bundle.
    pub objects: Vec<String>,
}
impl Bundle {
    pub fn new(name: impl Into<String>, package: impl Into<String>, bundle_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package: package.into(),
            bundle_path: bundle_path.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_replaces(mut self, replaces: impl Into<String>) -> Self {
        self.replaces = Some(replaces.into());
        self
    }

    pub fn with_skips(mut self, skips: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.skips = skips.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_provided_api(mut self, api: Api) -> Self {
        self.provided_apis.push(api);
        self
    }

    pub fn with_required_api(mut self, api: Api) -> Self {
        self.required_apis.push(api);
        self
    }

    pub fn with_substitutes_for(mut self, name: impl Into<String>) -> Self {
        self.substitutes_for = Some(name.into());
        self
    }

    /// Version as text, empty when the bundle carries no version.
    pub fn version_string(&self) -> String {
        self.version.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    /// The direct predecessor, treating an empty string as "none".
    pub fn replaces(&self) -> Option<&str> {
        self.replaces.as_deref().filter(|r| !r.is_empty())
    }

    /// Properties to persist for this bundle: the declared ones plus those
    /// derived from its identity and provided APIs, without duplicate
    /// `(type, value)` pairs. Declaration order is kept.
    pub fn effective_properties(&self) -> Vec<Property> {
        let mut out = Vec::with_capacity(self.properties.len() + self.provided_apis.len() + 1);
        let derived = self
            .provided_apis
            .iter()
            .map(|api| Property::gvk(&api.gvk()))
            .chain(self.substitutes_for.as_deref().map(Property::substitutes_for));
        for property in self.properties.iter().cloned().chain(derived) {
            if !out.contains(&property) {
                out.push(property);
            }
        }
        if !out.iter().any(|p| p.kind == property::PACKAGE) {
            out.push(Property::package(&self.package, &self.version_string()));
        }
        out
    }

    /// Dependencies to persist: declared ones plus one `olm.gvk.required` per
    /// required API, deduplicated.
    pub fn effective_dependencies(&self) -> Vec<Property> {
        let mut out = Vec::with_capacity(self.dependencies.len() + self.required_apis.len());
        let derived = self.required_apis.iter().map(|api| Property::gvk_required(&api.gvk()));
        for dependency in self.dependencies.iter().cloned().chain(derived) {
            if !out.contains(&dependency) {
                out.push(dependency);
            }
        }
        out
    }
}
