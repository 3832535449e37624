//! On-disk cache of a declarative-config operator catalog.
//!
//! A [`Cache`] turns a [`SourceCatalog`] (a directory of JSON metas) into a
//! per-bundle store plus a [`PackageIndex`] of channel graphs, and answers
//! [`Query`](opcat_query::Query) calls through a [`CacheQuerier`]. A digest
//! over the source and the stored contents tells whether the cache still
//! matches its source.
//!
//! Storage is pluggable through [`CacheBackend`](backend::CacheBackend); the
//! backend for a directory is picked from what the directory contains.

pub mod backend;
mod declcfg;
mod engine;
pub mod error;
mod index;
mod path;
mod query;
mod source;
mod walk;

pub use crate::backend::{BackendHandle, CacheBackend};
pub use crate::engine::{Cache, default_parallelism};
pub use crate::index::{BundleIndex, BundleRef, ChannelIndex, PackageIndex, PackageIndexEntry};
pub use crate::path::validate_segment;
pub use crate::query::CacheQuerier;
pub use crate::source::SourceCatalog;
