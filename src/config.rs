//! Configuration file
//!
//! TOML configuration for STUN servers and punch timing. Looked up at:
//! - the path given on the command line, or
//! - the platform config directory (`~/.config/holepunch/config.toml` on Linux)
//!
//! and falls back to built-in defaults when neither exists.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::network::{PunchConfig, StunServer, DEFAULT_PROBE_TIMEOUT};

/// Application name used for the configuration directory
const APP_NAME: &str = "holepunch";

/// Longest allowed poll interval; tasks must notice cancellation within 1s
const MAX_POLL_INTERVAL_MS: u64 = 1_000;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// STUN servers, tried in order
    pub stun_servers: Vec<StunServer>,

    /// Time to wait for each STUN response
    pub probe_timeout_ms: u64,

    /// Punch timing
    pub punch: PunchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stun_servers: StunServer::defaults(),
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
            punch: PunchConfig::default(),
        }
    }
}

impl Config {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stun_servers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one STUN server is required".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe_timeout_ms must be > 0".to_string()));
        }

        let punch = &self.punch;
        let non_zero = [
            ("punch_interval_ms", punch.punch_interval_ms),
            ("aggressive_interval_ms", punch.aggressive_interval_ms),
            ("poll_interval_ms", punch.poll_interval_ms),
            ("connect_timeout_ms", punch.connect_timeout_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
        }

        if punch.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_ms must be at most {}",
                MAX_POLL_INTERVAL_MS
            )));
        }

        Ok(())
    }
}

/// Default configuration file path, if the platform has a config directory
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from `path`, or from the default location
///
/// An explicit path must exist; a missing default file yields the defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => {
                debug!("No config file, using defaults");
                return Ok(Config::default());
            }
        },
    };

    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    debug!("Loaded config from {:?}", path);

    Config::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_partial_config() {
        let config = Config::from_toml_str(
            r#"
stun_servers = ["stun.example.org:3478", "127.0.0.1:3479"]

[punch]
aggressive = true
port_spread = 5
"#,
        )
        .unwrap();

        assert_eq!(config.stun_servers.len(), 2);
        assert_eq!(config.stun_servers[1], StunServer::new("127.0.0.1", 3479));
        assert!(config.punch.aggressive);
        assert_eq!(config.punch.port_spread, 5);
        // Unset fields keep their defaults
        assert_eq!(config.punch.poll_interval_ms, 1_000);
        assert_eq!(config.probe_timeout_ms, 3_000);
    }

    #[test]
    fn test_reject_bad_stun_server() {
        let result = Config::from_toml_str(r#"stun_servers = ["no-port"]"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_reject_empty_servers() {
        let result = Config::from_toml_str("stun_servers = []");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_reject_slow_poll_interval() {
        let result = Config::from_toml_str("[punch]\npoll_interval_ms = 5000");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = Config::default();
        let content = toml::to_string_pretty(&config).unwrap();
        assert_eq!(Config::from_toml_str(&content).unwrap(), config);
    }

    #[test]
    fn test_missing_explicit_path() {
        let result = load_config(Some(Path::new("/nonexistent/holepunch.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
