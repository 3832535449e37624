//! opcat: build catalog caches, maintain the registry and query either.

mod cli;
mod error;
mod serve;

use crate::cli::{
    Backend, CacheCommand, Cli, Commands, QueryArgs, QueryCommand, RegistryCommand, ServeArgs, SourceArgs,
};
use crate::error::{ErrorKind, Result};
use clap::Parser;
use exn::ResultExt;
use opcat_cache::{Cache, SourceCatalog, default_parallelism};
use opcat_config::Config;
use opcat_model::{Bundle, PackageManifest};
use opcat_query::Query;
use opcat_registry::{Database, LoadMode, Loader, SqlQuerier};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        },
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match cli.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).without_time().init();

    let config = Config::load(cli.config.as_deref()).map_err(|e| e.raise(ErrorKind::Config))?;
    debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Cache(command) => cache(command, &config).await,
        Commands::Registry(command) => registry(command, &config).await,
        Commands::Query(args) => query(args, &config).await,
        Commands::Serve(args) => serve(args, &config).await,
    }
}

/// Cancelled on the first Ctrl-C.
fn interrupt_token(what: &'static str) -> CancellationToken {
    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping {what}");
            interrupt.cancel();
        }
    });
    token
}

fn source(args: SourceArgs, config: &Config) -> Result<SourceCatalog> {
    match args.source.or_else(|| config.cache.source.clone()) {
        Some(root) => Ok(SourceCatalog::new(root)),
        None => exn::bail!(ErrorKind::Usage("no catalog source: pass --source or set cache.source")),
    }
}

async fn open_cache(config: &Config) -> Result<Cache> {
    Cache::open(&config.cache.directory).await.map_err(|e| e.raise(ErrorKind::Cache))
}

async fn cache(command: CacheCommand, config: &Config) -> Result<()> {
    let raise = |e: opcat_cache::error::Error| e.raise(ErrorKind::Cache);
    match command {
        CacheCommand::Build { source: args, parallelism } => {
            let source = source(args, config)?;
            let parallelism = parallelism.or(config.cache.parallelism).unwrap_or_else(default_parallelism);
            if parallelism == 0 {
                exn::bail!(ErrorKind::Usage("--parallelism must be at least 1"));
            }
            let mut cache = open_cache(config).await?.with_parallelism(parallelism);
            cache.build_with_cancel(&source, interrupt_token("build")).await.map_err(raise)?;
            let packages = cache.index().map(|i| i.len()).unwrap_or_default();
            info!(packages, backend = cache.backend().name(), "cache built");
            println!("built {packages} package(s) into {}", config.cache.directory.display());
        },
        CacheCommand::Check { source: args } => {
            let source = source(args, config)?;
            let cache = open_cache(config).await?;
            cache.check_integrity(&source).await.map_err(raise)?;
            println!("cache matches {}", source.root().display());
        },
        CacheCommand::Load { source: args } => {
            let mut cache = open_cache(config).await?;
            match source(args, config) {
                Ok(source) => cache.load_or_rebuild(&source).await.map_err(raise)?,
                Err(_) => cache.load().await.map_err(raise)?,
            }
            let packages = cache.index().map(|i| i.len()).unwrap_or_default();
            println!("loaded {packages} package(s) from {}", config.cache.directory.display());
        },
    }
    Ok(())
}

/// Open the registry for reading, refusing one whose schema is behind.
async fn open_registry(config: &Config) -> Result<Database> {
    let raise = |e: opcat_registry::error::Error| e.raise(ErrorKind::Registry);
    let db = Database::open(&config.registry.database).await.map_err(raise)?;
    if let Err(err) = db.ensure_current().await {
        db.close().await;
        return Err(raise(err));
    }
    Ok(db)
}

async fn registry(command: RegistryCommand, config: &Config) -> Result<()> {
    let raise = |e: opcat_registry::error::Error| e.raise(ErrorKind::Registry);
    if let RegistryCommand::Migrate = command {
        let db = Database::open(&config.registry.database).await.map_err(raise)?;
        let outcome = db.migrate().await.map_err(raise);
        db.close().await;
        match outcome?.as_slice() {
            [] => println!("registry schema at {} is up to date", config.registry.database.display()),
            applied => println!("applied migration(s) {applied:?} to {}", config.registry.database.display()),
        }
        return Ok(());
    }

    // Writers bring the schema up to date first.
    let db = Database::connect(&config.registry.database).await.map_err(raise)?;
    let loader = Loader::from(&db).with_mode(config.registry.mode).with_alpha(config.registry.enable_alpha);
    let outcome = match command {
        RegistryCommand::Migrate => Ok(()),
        RegistryCommand::Add { bundles, manifests } => add(&loader, &bundles, &manifests).await,
        RegistryCommand::Deprecate { bundle_paths } => loader.deprecate_bundles(&bundle_paths[..]).await.map_err(raise),
        RegistryCommand::PruneStranded => loader.remove_stranded_bundles().await.map_err(raise).map(|removed| {
            println!("removed {removed} stranded bundle(s)");
        }),
    };
    db.close().await;
    outcome
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await.or_raise(|| ErrorKind::Input(path.to_path_buf()))?;
    serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Input(path.to_path_buf()))
}

/// Load bundle documents, then package manifests.
///
/// In permissive mode every file is attempted and the first failure is
/// returned at the end; strict mode stops at the first failure.
async fn add(loader: &Loader, bundles: &[PathBuf], manifests: &[PathBuf]) -> Result<()> {
    let raise = |e: opcat_registry::error::Error| e.raise(ErrorKind::Registry);
    let mut documents: Vec<Bundle> = Vec::with_capacity(bundles.len());
    for path in bundles {
        documents.push(read_json(path).await?);
    }
    let mut outcome = loader.add_bundles(&documents).await.map_err(raise);
    if outcome.is_err() && loader.mode() == LoadMode::Strict {
        return outcome;
    }
    for path in manifests {
        let manifest: PackageManifest = read_json(path).await?;
        match loader.add_package_channels(&manifest).await {
            Ok(()) => info!(package = %manifest.package_name, "package channels loaded"),
            Err(err) if loader.mode() == LoadMode::Strict => return Err(raise(err)),
            Err(err) => {
                warn!(package = %manifest.package_name, error = %*err, "package channels failed to load");
                outcome = outcome.and(Err(raise(err)));
            },
        }
    }
    println!("processed {} bundle(s) and {} package manifest(s)", documents.len(), manifests.len());
    outcome
}

/// The query backend selected by `from`, and the registry it holds open.
async fn querier(from: Backend, config: &Config) -> Result<(Arc<dyn Query>, Option<Database>)> {
    match from {
        Backend::Cache => {
            let raise = |e: opcat_cache::error::Error| e.raise(ErrorKind::Cache);
            let mut cache = open_cache(config).await?;
            cache.load().await.map_err(raise)?;
            Ok((Arc::new(cache.querier().map_err(raise)?), None))
        },
        Backend::Registry => {
            let db = open_registry(config).await?;
            Ok((Arc::new(SqlQuerier::from(&db)), Some(db)))
        },
    }
}

async fn query(args: QueryArgs, config: &Config) -> Result<()> {
    let raise = |e: opcat_query::error::Error| e.raise(ErrorKind::Query);
    let (querier, db) = querier(args.from, config).await?;
    let outcome = match args.command {
        QueryCommand::Head { package, channel } => querier.get_bundle_for_channel(&package, &channel).await,
        QueryCommand::Replaces { bundle, package, channel } => {
            querier.get_bundle_that_replaces(&bundle, &package, &channel).await
        },
    };
    if let Some(db) = db {
        db.close().await;
    }
    let bundle = outcome.map_err(raise)?;
    match bundle.version.is_empty() {
        true => println!("{}", bundle.csv_name),
        false => println!("{} {}", bundle.csv_name, bundle.version),
    }
    Ok(())
}

async fn serve(args: ServeArgs, config: &Config) -> Result<()> {
    let listen = args.listen.unwrap_or(config.serve.listen);
    let (querier, db) = querier(args.from, config).await?;
    let listener = TcpListener::bind(listen).await.or_raise(|| ErrorKind::Serve)?;
    let outcome = serve::serve(querier, listener, interrupt_token("server")).await;
    if let Some(db) = db {
        db.close().await;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use opcat_model::Version;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    async fn heads(db: &Database) -> Vec<String> {
        let query = SqlQuerier::from(db);
        let package = query.get_package("etcd").await.unwrap();
        package.channels.into_iter().map(|c| c.head).collect()
    }

    #[tokio::test]
    async fn test_add_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = write(dir.path(), "v1.json", r#"{"name":"etcd.v0.9.0","package":"etcd","version":"0.9.0","bundle_path":"quay.io/etcd:v0.9.0"}"#);
        let v2 = write(
            dir.path(),
            "v2.json",
            r#"{"name":"etcd.v0.9.2","package":"etcd","version":"0.9.2","bundle_path":"quay.io/etcd:v0.9.2","replaces":"etcd.v0.9.0"}"#,
        );
        let manifest = write(
            dir.path(),
            "package.json",
            r#"{"packageName":"etcd","channels":[{"name":"alpha","currentCSV":"etcd.v0.9.2"}],"defaultChannelName":"alpha"}"#,
        );

        let db = Database::connect_in_memory().await.unwrap();
        let loader = Loader::from(&db);
        add(&loader, &[v1, v2], &[manifest]).await.unwrap();
        assert_eq!(heads(&db).await, vec!["etcd.v0.9.2"]);
        let head = SqlQuerier::from(&db).get_bundle_for_channel("etcd", "alpha").await.unwrap();
        assert_eq!(head.replaces, "etcd.v0.9.0");
        assert_eq!(head.version, Version::new(0, 9, 2).to_string());
    }

    #[tokio::test]
    async fn test_add_rejects_unreadable_input() {
        let dir = tempfile::tempdir().unwrap();
        let broken = write(dir.path(), "broken.json", "{not json");
        let db = Database::connect_in_memory().await.unwrap();
        let loader = Loader::from(&db);

        let err = add(&loader, &[broken.clone()], &[]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Input(path) if *path == broken));
        let missing = dir.path().join("missing.json");
        let err = add(&loader, &[], &[missing]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Input(_)));
    }

    #[tokio::test]
    async fn test_add_permissive_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let good = write(dir.path(), "good.json", r#"{"name":"k.v1","package":"k","bundle_path":"quay.io/k:v1"}"#);
        let nameless = write(dir.path(), "nameless.json", r#"{"package":"k"}"#);
        let manifest = write(
            dir.path(),
            "k.json",
            r#"{"packageName":"k","channels":[{"name":"stable","currentCSV":"k.v1"}],"defaultChannelName":"stable"}"#,
        );
        let db = Database::connect_in_memory().await.unwrap();

        let err = add(&Loader::from(&db), &[nameless.clone(), good.clone()], &[manifest.clone()]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Registry));
        let head = SqlQuerier::from(&db).get_bundle_for_channel("k", "stable").await.unwrap();
        assert_eq!(head.csv_name, "k.v1");

        // Strict mode stops before the manifests.
        let db = Database::connect_in_memory().await.unwrap();
        let strict = Loader::from(&db).with_mode(LoadMode::Strict);
        add(&strict, &[nameless, good], &[manifest]).await.unwrap_err();
        assert!(SqlQuerier::from(&db).get_package("k").await.unwrap_err().is_not_found());
    }
}
