//! Data model for operator catalogs.
//!
//! A catalog is a set of packages. Each package has one or more upgrade
//! channels, and each channel is a graph of bundles linked by `replaces` and
//! `skips` edges. This crate holds the pure data types shared by the
//! relational loader, the cache and the query layer:
//!
//! - [`Bundle`]: the immutable release unit handed to the loaders.
//! - [`PackageManifest`]: channel heads and default channel of a package.
//! - [`graph`]: the in-memory replacement graph, head selection and the
//!   replacement walk that assigns depths and detects cycles.
//! - [`api`]: the records returned by queries.
//!
//! Nothing in here performs I/O.

pub mod api;
mod bundle;
pub mod error;
pub mod graph;
mod manifest;

pub use crate::bundle::{Api, Bundle, Gvk, Property, property};
pub use crate::manifest::{PackageChannel, PackageManifest};
pub use semver::Version;
