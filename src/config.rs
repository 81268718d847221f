use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::{
  AssetManifest, CacheVersion, ExcludeRules, WorkerOptions, DEFAULT_INSTALL_CONCURRENCY,
  FEATURE_FLAGS_PATH,
};

/// Environment variable carrying the build token, set by the deploy pipeline.
const BUILD_TAG_ENV: &str = "SWCACHE_BUILD_TAG";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the application is served from; relative manifest entries and
  /// proxied paths resolve against it
  pub origin: Url,
  #[serde(default)]
  pub version: VersionConfig,
  /// Assets to pre-cache, relative to the origin or absolute
  #[serde(default)]
  pub manifest: Vec<String>,
  /// Build-tool manifest, appended after `manifest`
  pub manifest_file: Option<PathBuf>,
  /// URLs containing any of these never touch the cache (`re:` for a regex)
  #[serde(default = "default_exclude")]
  pub exclude: Vec<String>,
  #[serde(default = "default_install_concurrency")]
  pub install_concurrency: usize,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub proxy: ProxyConfig,
  /// Also write logs to this file
  pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionConfig {
  /// Build token; derived from the manifest when unset
  pub build: Option<String>,
  /// Bump to force a fresh generation without a new build
  #[serde(default)]
  pub salt: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// Persistent SQLite database
  #[default]
  Sqlite,
  /// Process-lifetime only
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  #[serde(default)]
  pub backend: StorageBackend,
  /// Database path (default: $XDG_DATA_HOME/swcache/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen: default_listen(),
    }
  }
}

fn default_exclude() -> Vec<String> {
  vec![FEATURE_FLAGS_PATH.to_string()]
}

fn default_install_concurrency() -> usize {
  DEFAULT_INSTALL_CONCURRENCY
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create ./swcache.yaml or ~/.config/swcache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let mut config = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    // A relative manifest file is relative to the config, not the cwd
    if let (Some(file), Some(dir)) = (&config.manifest_file, path.parent()) {
      if file.is_relative() {
        config.manifest_file = Some(dir.join(file));
      }
    }

    Ok(config)
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Build token from the environment, if the deploy pipeline set one.
  pub fn build_tag_from_env() -> Option<String> {
    std::env::var(BUILD_TAG_ENV)
      .ok()
      .filter(|tag| !tag.trim().is_empty())
  }

  /// Resolve manifest, exclusion rules and version into worker options.
  ///
  /// `build` takes precedence over the configured build token.
  pub fn worker_options(&self, build: Option<&str>) -> Result<WorkerOptions> {
    let mut entries = self.manifest.clone();
    if let Some(file) = &self.manifest_file {
      entries.extend(AssetManifest::read_entries(file)?);
    }
    let manifest = AssetManifest::resolve(&self.origin, &entries)?;

    let exclude = ExcludeRules::parse(&self.exclude)?;
    if exclude.is_empty() {
      tracing::warn!("no exclude rules configured, every URL may be cached");
    }

    let build = build.or(self.version.build.as_deref());
    let version = CacheVersion::resolve(build, &self.version.salt, &manifest);

    Ok(WorkerOptions {
      version,
      manifest,
      exclude,
      install_concurrency: self.install_concurrency,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_defaults() {
    let config = Config::parse("origin: https://food.example/\n").unwrap();

    assert_eq!(config.exclude, vec![FEATURE_FLAGS_PATH]);
    assert_eq!(config.install_concurrency, DEFAULT_INSTALL_CONCURRENCY);
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(config.proxy.listen, default_listen());
    assert!(config.version.salt.is_empty());
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
origin: https://food.example/
version:
  build: v20230312
  salt: "-3"
manifest:
  - /
  - /index.html
  - /data/food.json
exclude:
  - featureFlags.json
  - "re:/api/"
storage:
  backend: memory
proxy:
  listen: 0.0.0.0:9000
"#,
    )
    .unwrap();

    let options = config.worker_options(None).unwrap();
    assert_eq!(options.version.as_str(), "v20230312-3");
    assert_eq!(options.manifest.len(), 3);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.proxy.listen.port(), 9000);

    let flags = Url::parse("https://food.example/featureFlags.json").unwrap();
    let api = Url::parse("https://food.example/api/user").unwrap();
    assert!(options.exclude.matches(&flags));
    assert!(options.exclude.matches(&api));
  }

  #[test]
  fn test_build_override_wins() {
    let config = Config::parse(
      "origin: https://food.example/\nversion:\n  build: from-config\n  salt: x\n",
    )
    .unwrap();
    let options = config.worker_options(Some("from-cli")).unwrap();
    assert_eq!(options.version.as_str(), "from-clix");
  }

  #[test]
  fn test_manifest_file_relative_to_config() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("assets.json"), r#"["/main.js", "/"]"#).unwrap();
    std::fs::write(
      dir.path().join("swcache.yaml"),
      "origin: https://food.example/\nmanifest: [\"/\"]\nmanifest_file: assets.json\n",
    )
    .unwrap();

    let config = Config::load(Some(&dir.path().join("swcache.yaml"))).unwrap();
    let options = config.worker_options(None).unwrap();
    let paths: Vec<&str> = options.manifest.urls().iter().map(|u| u.path()).collect();
    assert_eq!(paths, vec!["/", "/main.js"]);
  }

  #[test]
  fn test_missing_origin_is_an_error() {
    assert!(Config::parse("manifest: [/]\n").is_err());
  }

  #[test]
  fn test_explicit_missing_file() {
    let err = Config::load(Some(Path::new("/nonexistent/swcache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
