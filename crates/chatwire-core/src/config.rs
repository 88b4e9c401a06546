//! Client configuration.
//!
//! Values come from three layers, later ones winning:
//!
//! 1. Built-in defaults
//! 2. An optional JSON file (`~/.config/chatwire/config.json` by default)
//! 3. `CHATWIRE_*` environment variables
//!
//! ```json
//! {
//!   "base_url": "https://chat.example.com/api/v1",
//!   "thinking": true,
//!   "idle_timeout_secs": 120,
//!   "log_dir": "/tmp/chatwire-logs"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api/v1";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const CONFIG_FILE: &str = "config.json";
const CREDENTIAL_FILE: &str = "credentials.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// REST and stream base, including the API version prefix.
    pub base_url: String,

    /// Default thinking mode for new generations.
    pub thinking: bool,

    /// Seconds without any inbound frame before an active stream is
    /// abandoned. `0` disables the timeout.
    pub idle_timeout_secs: u64,

    /// Timeout for plain request/response REST calls.
    pub request_timeout_secs: u64,

    /// Directory for raw wire logs; `None` disables them.
    pub log_dir: Option<PathBuf>,

    /// Where the CLI keeps the bearer credential between runs.
    pub credential_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            thinking: true,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            log_dir: None,
            credential_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from `path` (or the default location) and apply
    /// environment overrides.
    ///
    /// An explicitly given file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `CHATWIRE_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CHATWIRE_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(value) = lookup("CHATWIRE_THINKING") {
            self.thinking = parse_switch(&value).ok_or_else(|| ConfigError::InvalidValue {
                key: "CHATWIRE_THINKING".to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("CHATWIRE_IDLE_TIMEOUT") {
            self.idle_timeout_secs =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: "CHATWIRE_IDLE_TIMEOUT".to_string(),
                        value: value.clone(),
                    })?;
        }
        if let Some(dir) = lookup("CHATWIRE_LOG_DIR").filter(|v| !v.trim().is_empty()) {
            self.log_dir = Some(PathBuf::from(dir.trim()));
        }
        Ok(())
    }

    /// The base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Credential file location: explicit path, or next to the config file.
    pub fn credential_path(&self) -> Option<PathBuf> {
        self.credential_path
            .clone()
            .or_else(|| paths::config_dir().map(|dir| dir.join(CREDENTIAL_FILE)))
    }
}

/// Default `config.json` location.
pub fn default_config_path() -> Option<PathBuf> {
    paths::config_dir().map(|dir| dir.join(CONFIG_FILE))
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" | "enabled" => Some(true),
        "0" | "false" | "off" | "no" | "disabled" => Some(false),
        _ => None,
    }
}
