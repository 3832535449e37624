mod bundle;
mod entry;

pub(crate) use self::bundle::{BundleRow, EdgeRow};
pub(crate) use self::entry::{EntryRow, GraphRow};
