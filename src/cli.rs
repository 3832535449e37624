use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "opcat", version, about = "Operator catalog caches, registries and queries")]
pub struct Cli {
    /// Configuration file (toml, yaml or json).
    #[arg(short, long, global = true, env = "OPCAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build and inspect the on-disk catalog cache.
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Maintain the SQLite registry.
    #[command(subcommand)]
    Registry(RegistryCommand),
    /// Ask the catalog about channels and upgrade edges.
    Query(QueryArgs),
    /// Answer catalog queries over HTTP until interrupted.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
pub struct SourceArgs {
    /// Catalog directory; overrides `cache.source`.
    #[arg(short, long)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Rebuild the cache from the source catalog.
    Build {
        #[command(flatten)]
        source: SourceArgs,
        /// Packages indexed concurrently; overrides `cache.parallelism`.
        #[arg(short = 'j', long)]
        parallelism: Option<usize>,
    },
    /// Check the cache digest against the source catalog.
    Check {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Load the cache, rebuilding it first if it is stale.
    Load {
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[derive(Debug, Subcommand)]
pub enum RegistryCommand {
    /// Create the database or bring its schema up to date.
    Migrate,
    /// Load bundles and package channel layouts from JSON files.
    #[command(arg_required_else_help = true)]
    Add {
        /// Bundle document; repeat for several bundles.
        #[arg(short, long = "bundle", value_name = "FILE")]
        bundles: Vec<PathBuf>,
        /// Package manifest, loaded after every bundle.
        #[arg(short, long = "manifest", value_name = "FILE")]
        manifests: Vec<PathBuf>,
    },
    /// Deprecate bundles by bundle path (image reference).
    Deprecate {
        #[arg(required = true)]
        bundle_paths: Vec<String>,
    },
    /// Delete bundles that no channel refers to.
    PruneStranded,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum Backend {
    #[default]
    Cache,
    Registry,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Where answers come from.
    #[arg(short, long, value_enum, default_value_t)]
    pub from: Backend,

    /// Address to bind; overrides `serve.listen`.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    /// Where answers come from.
    #[arg(short, long, value_enum, default_value_t)]
    pub from: Backend,

    #[command(subcommand)]
    pub command: QueryCommand,
}

#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    /// The head bundle of a channel.
    Head { package: String, channel: String },
    /// The bundle that replaces (or skips) a bundle in a channel.
    Replaces { bundle: String, package: String, channel: String },
}
