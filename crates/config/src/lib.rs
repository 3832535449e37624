//! Layered configuration for opcat.
//!
//! Values are merged, later layers winning:
//!
//! 1. built-in defaults,
//! 2. a configuration file (`toml`, `yaml` or `json`, picked by extension),
//!    either given explicitly or found in the platform config directory,
//! 3. `OPCAT_`-prefixed environment variables, with `__` separating nested
//!    keys (`OPCAT_CACHE__DIRECTORY`, `OPCAT_REGISTRY__MODE`,
//!    `OPCAT_SERVE__LISTEN`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use opcat_registry::LoadMode;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_PREFIX: &str = "OPCAT_";
pub const DEFAULT_PORT: u16 = 50051;
const CONFIG_FILES: [&str; 4] = ["config.toml", "config.yaml", "config.yml", "config.json"];

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "opcat")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
    pub serve: ServeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// SQLite database file.
    pub database: PathBuf,
    pub mode: LoadMode,
    /// Allow alpha bundle features such as `substitutesFor`.
    pub enable_alpha: bool,
}
impl Default for RegistryConfig {
    fn default() -> Self {
        let database = match project_dirs() {
            Some(dirs) => dirs.data_dir().join("registry.db"),
            None => PathBuf::from("registry.db"),
        };
        Self { database, mode: LoadMode::default(), enable_alpha: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub directory: PathBuf,
    /// Declarative config catalog the cache is built from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Build workers; the number of available cores when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
}
impl Default for CacheConfig {
    fn default() -> Self {
        let directory = match project_dirs() {
            Some(dirs) => dirs.cache_dir().to_path_buf(),
            None => PathBuf::from(".opcat-cache"),
        };
        Self { directory, source: None, parallelism: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Address the query server binds to.
    pub listen: SocketAddr,
}
impl Default for ServeConfig {
    fn default() -> Self {
        Self { listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)) }
    }
}

impl Config {
    /// First existing `config.{toml,yaml,yml,json}` in the platform config
    /// directory.
    pub fn default_path() -> Option<PathBuf> {
        let dirs = project_dirs()?;
        CONFIG_FILES.iter().map(|name| dirs.config_dir().join(name)).find(|path| path.is_file())
    }

    /// The merged layers, before extraction.
    ///
    /// An explicit `path` must exist; without one, the default location is
    /// used only if a file is there.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        let file = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path(),
        };
        if let Some(file) = file {
            debug!(path = %file.display(), "reading configuration file");
            figment = match file.extension().and_then(|e| e.to_str()) {
                Some("toml") => figment.merge(Toml::file_exact(&file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file_exact(&file)),
                Some("json") => figment.merge(Json::file_exact(&file)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(file)),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate the configuration.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// let config = opcat_config::Config::load(None)?;
    /// println!("cache at {}", config.cache.directory.display());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Config = match Self::figment(path)?.extract() {
            Ok(config) => config,
            Err(err) => exn::bail!(ErrorKind::Extract(err.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.database.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Invalid { key: "registry.database", reason: "path must not be empty" });
        }
        if self.cache.directory.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Invalid { key: "cache.directory", reason: "path must not be empty" });
        }
        if self.cache.source.as_ref().is_some_and(|s| s.as_os_str().is_empty()) {
            exn::bail!(ErrorKind::Invalid { key: "cache.source", reason: "path must not be empty" });
        }
        if self.cache.parallelism == Some(0) {
            exn::bail!(ErrorKind::Invalid { key: "cache.parallelism", reason: "must be at least 1" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    fn load_in(jail: &Jail, file: &str) -> Result<Config> {
        Config::load(Some(jail.directory().join(file).as_path()))
    }

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "opcat.toml",
                r#"
                    [registry]
                    database = "/srv/registry.db"
                    mode = "strict"

                    [cache]
                    directory = "/srv/cache"
                    parallelism = 2
                "#,
            )?;
            jail.set_env("OPCAT_CACHE__PARALLELISM", "8");
            jail.set_env("OPCAT_REGISTRY__ENABLE_ALPHA", "true");
            jail.set_env("OPCAT_SERVE__LISTEN", "0.0.0.0:8080");

            let config = load_in(jail, "opcat.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.registry.database, PathBuf::from("/srv/registry.db"));
            assert_eq!(config.registry.mode, LoadMode::Strict);
            assert!(config.registry.enable_alpha);
            assert_eq!(config.cache.directory, PathBuf::from("/srv/cache"));
            assert_eq!(config.cache.source, None);
            assert_eq!(config.cache.parallelism, Some(8));
            assert_eq!(config.serve.listen, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
            Ok(())
        });
    }

    #[test]
    fn test_yaml_keeps_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("opcat.yaml", "cache:\n  source: /srv/catalog\n")?;
            let config = load_in(jail, "opcat.yaml").map_err(|e| e.to_string())?;
            assert_eq!(config.cache.source, Some(PathBuf::from("/srv/catalog")));
            assert_eq!(config.registry, RegistryConfig::default());
            assert_eq!(config.registry.mode, LoadMode::Permissive);
            assert_eq!(config.serve.listen.port(), DEFAULT_PORT);
            Ok(())
        });
    }

    #[rstest]
    #[case::zero_workers("[cache]\nparallelism = 0\n", "cache.parallelism")]
    #[case::empty_database("[registry]\ndatabase = \"\"\n", "registry.database")]
    #[case::empty_directory("[cache]\ndirectory = \"\"\n", "cache.directory")]
    #[case::empty_source("[cache]\nsource = \"\"\n", "cache.source")]
    fn test_rejects_invalid_values(#[case] contents: &str, #[case] expected: &'static str) {
        Jail::expect_with(|jail| {
            jail.create_file("opcat.toml", contents)?;
            let err = load_in(jail, "opcat.toml").unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid { key, .. } if *key == expected));
            Ok(())
        });
    }

    #[test]
    fn test_unknown_mode() {
        Jail::expect_with(|jail| {
            jail.create_file("opcat.toml", "[registry]\nmode = \"lenient\"\n")?;
            let err = load_in(jail, "opcat.toml").unwrap_err();
            assert!(matches!(&*err, ErrorKind::Extract(_)));
            Ok(())
        });
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(dir.path().join("missing.toml").as_path())).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opcat.ini");
        std::fs::write(&path, "cache=1").unwrap();
        let err = Config::load(Some(path.as_path())).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
    }
}
