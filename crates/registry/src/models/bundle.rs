use crate::error::{Error, ErrorKind, Result};
use exn::ResultExt;
use opcat_model::{Bundle, api};

/// One `operatorbundle` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BundleRow {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) bundlepath: String,
    pub(crate) replaces: Option<String>,
    pub(crate) skips: String,
    pub(crate) skiprange: Option<String>,
    pub(crate) substitutesfor: Option<String>,
    pub(crate) csv: Option<String>,
    pub(crate) bundle: String,
}
impl TryFrom<&Bundle> for BundleRow {
    type Error = Error;
    fn try_from(bundle: &Bundle) -> Result<Self> {
        let skips: Vec<&String> = bundle.skips.iter().filter(|s| !s.is_empty()).collect();
        Ok(Self {
            name: bundle.name.clone(),
            version: bundle.version_string(),
            bundlepath: bundle.bundle_path.clone(),
            replaces: bundle.replaces().map(str::to_string),
            skips: serde_json::to_string(&skips).or_raise(|| ErrorKind::InvalidData("skips"))?,
            skiprange: bundle.skip_range.clone().filter(|r| !r.is_empty()),
            substitutesfor: bundle.substitutes_for.clone().filter(|s| !s.is_empty()),
            csv: bundle.csv_json.clone(),
            bundle: serde_json::to_string(&bundle.objects).or_raise(|| ErrorKind::InvalidData("bundle objects"))?,
        })
    }
}
impl BundleRow {
    /// Convert into a query record. Properties, dependencies and APIs live
    /// in other tables and are filled in by the caller.
    pub(crate) fn into_api(self, package: &str, channel: &str) -> Result<api::Bundle> {
        Ok(api::Bundle {
            skips: serde_json::from_str(&self.skips).or_raise(|| ErrorKind::InvalidData("skips"))?,
            objects: serde_json::from_str(&self.bundle).or_raise(|| ErrorKind::InvalidData("bundle objects"))?,
            csv_name: self.name,
            package_name: package.to_string(),
            channel_name: channel.to_string(),
            bundle_path: self.bundlepath,
            version: self.version,
            skip_range: self.skiprange.unwrap_or_default(),
            replaces: self.replaces.unwrap_or_default(),
            substitutes_for: self.substitutesfor.unwrap_or_default(),
            csv_json: self.csv.unwrap_or_default(),
            ..Default::default()
        })
    }
}

/// The outgoing edges of a bundle, as followed by the replacement walk.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EdgeRow {
    pub(crate) replaces: Option<String>,
    pub(crate) skips: String,
}
impl EdgeRow {
    pub(crate) fn skips(&self) -> Result<Vec<String>> {
        Ok(serde_json::from_str(&self.skips).or_raise(|| ErrorKind::InvalidData("skips"))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcat_model::Version;

    #[test]
    fn test_model_to_row_to_api() {
        let mut model = Bundle::new("etcd.v0.9.2", "etcd", "quay.io/etcd:0.9.2")
            .with_version(Version::new(0, 9, 2))
            .with_replaces("etcd.v0.9.0")
            .with_skips(["etcd.v0.9.1", ""]);
        model.objects.push(r#"{"kind":"CustomResourceDefinition"}"#.to_string());
        let row = BundleRow::try_from(&model).unwrap();
        assert_eq!(row.skips, r#"["etcd.v0.9.1"]"#);
        assert_eq!(row.version, "0.9.2");
        let record = row.into_api("etcd", "alpha").unwrap();
        assert_eq!(record.replaces, "etcd.v0.9.0");
        assert_eq!(record.skips, vec!["etcd.v0.9.1".to_string()]);
        assert_eq!(record.objects.len(), 1);
        assert_eq!(record.channel_name, "alpha");
    }

    #[test]
    fn test_empty_replaces_is_null() {
        let model = Bundle::new("etcd.v0.9.0", "etcd", "quay.io/etcd:0.9.0").with_replaces("");
        let row = BundleRow::try_from(&model).unwrap();
        assert_eq!(row.replaces, None);
    }

    #[test]
    fn test_corrupt_skips() {
        let edges = EdgeRow { replaces: None, skips: "not json".to_string() };
        let err = edges.skips().unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("skips")));
    }
}
