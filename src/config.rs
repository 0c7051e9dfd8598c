use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::RetryPolicy;

/// Default mock backend the client talks to.
pub const DEFAULT_API_URL: &str = "https://67ac71475853dfff53dab929.mockapi.io/api/v1";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  /// Where the database and logs live (defaults to $XDG_DATA_HOME/spendsync)
  pub data_dir: Option<PathBuf>,
  /// Default tracing filter directive, overridden by RUST_LOG
  pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  #[serde(default = "default_api_url")]
  pub base_url: String,
  /// Per-attempt request timeout
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: default_api_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
  #[serde(default = "default_attempts")]
  pub attempts: u32,
  #[serde(default = "default_base_delay_ms")]
  pub base_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      attempts: default_attempts(),
      base_delay_ms: default_base_delay_ms(),
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy {
      attempts: self.attempts,
      base_delay: Duration::from_millis(self.base_delay_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Cached responses older than this are never served
  #[serde(default = "default_max_age_secs")]
  pub max_age_secs: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_age_secs: default_max_age_secs(),
    }
  }
}

impl CacheConfig {
  pub fn max_age(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.max_age_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Replay passes a retryable operation survives before it is dropped
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: default_max_retries(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: default_probe_interval_secs(),
    }
  }
}

fn default_api_url() -> String {
  DEFAULT_API_URL.to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_attempts() -> u32 {
  3
}

fn default_base_delay_ms() -> u64 {
  1000
}

fn default_max_age_secs() -> i64 {
  5 * 60
}

fn default_max_retries() -> u32 {
  3
}

fn default_probe_interval_secs() -> u64 {
  5
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./spendsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/spendsync/config.yaml
  ///
  /// Without a file the built-in defaults apply. `SPENDSYNC_API_URL`
  /// overrides the backend URL either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(url) = std::env::var("SPENDSYNC_API_URL") {
      config.api.base_url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("spendsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("spendsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Directory holding the database and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("spendsync"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.api.base_url, DEFAULT_API_URL);
    assert_eq!(config.api.timeout_secs, 10);
    assert_eq!(config.retry.policy(), RetryPolicy::default());
    assert_eq!(config.cache.max_age(), chrono::Duration::minutes(5));
    assert_eq!(config.queue.max_retries, 3);
  }

  #[test]
  fn test_partial_sections_override() {
    let config = Config::parse(
      r#"
api:
  base_url: http://localhost:3000/api/v1
retry:
  base_delay_ms: 250
data_dir: /tmp/spendsync
"#,
    )
    .unwrap();

    assert_eq!(config.api.base_url, "http://localhost:3000/api/v1");
    assert_eq!(config.api.timeout_secs, 10);
    assert_eq!(config.retry.attempts, 3);
    assert_eq!(config.retry.policy().base_delay, Duration::from_millis(250));
    assert_eq!(
      config.data_dir().unwrap(),
      PathBuf::from("/tmp/spendsync")
    );
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
