//! YAML configuration: backend location, cache TTLs, retry limits and storage.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Cookie carrying the anti-forgery token
  #[serde(default = "default_csrf_cookie")]
  pub csrf_cookie: String,
  /// Header the anti-forgery token is sent in
  #[serde(default = "default_csrf_header")]
  pub csrf_header: String,
  /// Endpoint that rotates the session cookies
  #[serde(default = "default_refresh_path")]
  pub refresh_path: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_csrf_cookie() -> String {
  "csrftoken".to_string()
}

fn default_csrf_header() -> String {
  "X-CSRFToken".to_string()
}

fn default_refresh_path() -> String {
  "/api/accounts/token/refresh/".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

impl ApiConfig {
  pub fn new(base_url: impl Into<String>) -> Self {
    Self {
      base_url: base_url.into(),
      csrf_cookie: default_csrf_cookie(),
      csrf_header: default_csrf_header(),
      refresh_path: default_refresh_path(),
      timeout_secs: default_timeout_secs(),
    }
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: u64,
  /// Serve expired entries immediately while refreshing in the background
  #[serde(default)]
  pub stale_while_revalidate: bool,
}

fn default_ttl_secs() -> u64 {
  300
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: default_ttl_secs(),
      stale_while_revalidate: false,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Attempts allowed for validation/conflict failures before a mutation is marked failed
  #[serde(default = "default_terminal_attempts")]
  pub max_terminal_attempts: u32,
  /// Attempts allowed for network failures before a mutation is marked failed
  #[serde(default = "default_transient_attempts")]
  pub max_transient_attempts: u32,
}

fn default_terminal_attempts() -> u32 {
  1
}

fn default_transient_attempts() -> u32 {
  5
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_terminal_attempts: default_terminal_attempts(),
      max_transient_attempts: default_transient_attempts(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/rentsync/store.db)
  pub path: Option<PathBuf>,
  /// Keep everything in memory; nothing survives a restart
  #[serde(default)]
  pub in_memory: bool,
}

impl Config {
  /// Configuration with defaults for everything but the backend URL.
  pub fn with_base_url(base_url: impl Into<String>) -> Self {
    Self {
      api: ApiConfig::new(base_url),
      cache: CacheConfig::default(),
      queue: QueueConfig::default(),
      storage: StorageConfig::default(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rentsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rentsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/rentsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("rentsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rentsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Anti-forgery token override from the environment.
  pub fn csrf_token_override() -> Option<String> {
    std::env::var("RENTSYNC_CSRF_TOKEN").ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_gets_defaults() {
    let config = Config::parse("api:\n  base_url: https://rent.example\n").unwrap();
    assert_eq!(config.api.csrf_header, "X-CSRFToken");
    assert_eq!(config.api.refresh_path, "/api/accounts/token/refresh/");
    assert_eq!(config.cache.default_ttl(), Duration::from_secs(300));
    assert!(!config.cache.stale_while_revalidate);
    assert_eq!(config.queue.max_terminal_attempts, 1);
    assert!(config.storage.path.is_none());
  }

  #[test]
  fn test_overrides() {
    let yaml = r#"
api:
  base_url: https://rent.example
  timeout_secs: 5
cache:
  default_ttl_secs: 60
  stale_while_revalidate: true
queue:
  max_transient_attempts: 2
storage:
  in_memory: true
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.api.timeout(), Duration::from_secs(5));
    assert!(config.cache.stale_while_revalidate);
    assert_eq!(config.queue.max_transient_attempts, 2);
    assert!(config.storage.in_memory);
  }

  #[test]
  fn test_missing_base_url_is_an_error() {
    assert!(Config::parse("cache:\n  default_ttl_secs: 1\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
