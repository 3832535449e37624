//! SQLite-backed operator catalog registry.
//!
//! The registry is the relational form of a catalog. Bundles are stored once;
//! channel membership is materialized as `channel_entry` rows that form a
//! linked list per channel, each entry pointing at the entry it replaces.
//!
//! # Architecture
//! - [`Loader`] writes: bundles, package channel graphs, removals and
//!   deprecations. Each public operation is one transaction.
//! - [`GraphLoader`] reads the entries of a package back into the in-memory
//!   [`opcat_model::graph::Package`].
//! - [`SqlQuerier`] answers [`opcat_query::Query`] from the same tables.
//!
//! Every component is built from a [`Database`], which owns the pool and
//! applies the embedded migrations on connect.

mod db;
mod deprecate;
pub mod error;
mod graph;
mod loader;
mod models;
mod query;
mod store;

pub use crate::db::{Database, latest_schema_version};
pub use crate::graph::GraphLoader;
pub use crate::loader::{LoadMode, Loader};
pub use crate::query::SqlQuerier;
