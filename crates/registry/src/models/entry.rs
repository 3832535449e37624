use opcat_model::api::ChannelEntry;
use opcat_model::graph::BundleKey;

/// A channel entry joined with the name of the entry it replaces.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub(crate) package_name: String,
    pub(crate) channel_name: String,
    pub(crate) operatorbundle_name: String,
    pub(crate) replaces: Option<String>,
}
impl From<EntryRow> for ChannelEntry {
    fn from(row: EntryRow) -> Self {
        ChannelEntry::new(row.package_name, row.channel_name, row.operatorbundle_name, row.replaces)
    }
}

/// A channel entry with the identity of both ends of its replaces edge.
///
/// Bundle columns are NULL when the entry is a placeholder for a bundle that
/// was skipped but never added.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct GraphRow {
    pub(crate) channel_name: String,
    pub(crate) operatorbundle_name: String,
    pub(crate) bundlepath: Option<String>,
    pub(crate) version: Option<String>,
    pub(crate) replaces: Option<String>,
    pub(crate) replaces_bundlepath: Option<String>,
    pub(crate) replaces_version: Option<String>,
}
impl GraphRow {
    pub(crate) fn exists(&self) -> bool {
        self.bundlepath.is_some()
    }

    pub(crate) fn key(&self) -> BundleKey {
        BundleKey::new(
            &self.operatorbundle_name,
            self.version.as_deref().unwrap_or_default(),
            self.bundlepath.as_deref().unwrap_or_default(),
        )
    }

    pub(crate) fn replaces_key(&self) -> Option<BundleKey> {
        self.replaces.as_ref().map(|name| {
            BundleKey::new(
                name,
                self.replaces_version.as_deref().unwrap_or_default(),
                self.replaces_bundlepath.as_deref().unwrap_or_default(),
            )
        })
    }
}
