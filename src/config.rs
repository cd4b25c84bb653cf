use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fleet::types::{Session, UserRole};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub session: SessionConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL including the API prefix, e.g. https://fleet.example.com/api
  pub url: String,
  /// Per-request timeout of the HTTP transport
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  15
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Entries older than this are refetched when observed
  #[serde(default = "default_stale_time_secs")]
  pub stale_time_secs: u64,
  /// Delay before the single retry of a transient fetch failure
  #[serde(default = "default_retry_delay_ms")]
  pub retry_delay_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: default_stale_time_secs(),
      retry_delay_ms: default_retry_delay_ms(),
    }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> Duration {
    Duration::from_secs(self.stale_time_secs)
  }

  pub fn retry_delay(&self) -> Duration {
    Duration::from_millis(self.retry_delay_ms)
  }
}

fn default_stale_time_secs() -> u64 {
  300
}

fn default_retry_delay_ms() -> u64 {
  500
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
  /// Id of the logged-in user; stamped on optimistically created issues
  pub user_id: Option<String>,
  #[serde(default)]
  pub role: UserRole,
}

impl SessionConfig {
  pub fn session(&self) -> Option<Session> {
    self.user_id.as_ref().map(|user_id| Session {
      user_id: user_id.clone(),
      role: self.role,
    })
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Directory for daily log files (default: $XDG_DATA_HOME/fleetq/logs)
  pub directory: Option<PathBuf>,
  /// Default filter directive; RUST_LOG takes precedence
  #[serde(default = "default_level")]
  pub level: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      directory: None,
      level: default_level(),
    }
  }
}

impl LoggingConfig {
  pub fn directory(&self) -> PathBuf {
    self.directory.clone().unwrap_or_else(|| {
      dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("fleetq")
        .join("logs")
    })
  }
}

fn default_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fleetq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fleetq/config.yaml
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
        "No configuration file found. Create one at ~/.config/fleetq/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fleetq.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fleetq").join("config.yaml");
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
    if config.api.url.trim().is_empty() {
      return Err(eyre!("api.url must not be empty"));
    }
    Ok(config)
  }

  /// Get the API bearer token from environment variables.
  ///
  /// Checks FLEETQ_API_TOKEN first, then FLEET_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("FLEETQ_API_TOKEN")
      .or_else(|_| std::env::var("FLEET_API_TOKEN"))
      .map_err(|_| eyre!("API token not found. Set FLEETQ_API_TOKEN or FLEET_API_TOKEN environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  url: http://localhost:3000/api\n").unwrap();
    assert_eq!(config.api.timeout_secs, 15);
    assert_eq!(config.cache.stale_time(), Duration::from_secs(300));
    assert_eq!(config.cache.retry_delay(), Duration::from_millis(500));
    assert_eq!(config.logging.level, "info");
    assert!(config.session.session().is_none());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  url: https://fleet.example.com/api
  timeout_secs: 30
cache:
  stale_time_secs: 60
  retry_delay_ms: 0
session:
  user_id: "65f0c0ffee"
  role: admin
logging:
  directory: /tmp/fleetq-logs
  level: fleetq=debug
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.cache.retry_delay(), Duration::ZERO);
    let session = config.session.session().unwrap();
    assert_eq!(session.user_id, "65f0c0ffee");
    assert_eq!(session.role, UserRole::Admin);
    assert_eq!(config.logging.directory(), PathBuf::from("/tmp/fleetq-logs"));
  }

  #[test]
  fn test_missing_or_empty_url_rejected() {
    assert!(Config::parse("cache:\n  stale_time_secs: 10\n").is_err());
    assert!(Config::parse("api:\n  url: '  '\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
