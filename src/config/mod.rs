pub mod log_level;

use std::path::Path;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;

use crate::config::log_level::{deserialize_log_level, LogLevel};
use crate::{DEFAULT_DD_URL, DEFAULT_LISTEN_PORT};

/// Interval between host-tag refreshes when the config file doesn't set one.
pub const DEFAULT_HOST_TAGS_CACHING_INTERVAL_SECS: u64 = 3600;

/// `Config` is the main k9 configuration, loaded from the `k9.conf` YAML
/// file and overridable through `K9_`-prefixed environment variables.
#[derive(Debug, PartialEq, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub listen_port: u16,
    pub dd_url: String,
    pub api_key: String,
    pub application_key: String,
    /// Literal paths and glob patterns pointing at pruning policy files.
    pub pruning_configs: Vec<String>,
    pub host_tags_caching_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: LogLevel::default(),
            listen_port: DEFAULT_LISTEN_PORT,
            dd_url: DEFAULT_DD_URL.to_string(),
            api_key: String::default(),
            application_key: String::default(),
            pruning_configs: Vec::default(),
            host_tags_caching_interval: DEFAULT_HOST_TAGS_CACHING_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to parse the main config: {0}")]
    ParseError(String),
}

/// Reads the main config file, then applies `K9_`-prefixed environment
/// overrides. A missing or unparseable file is an error; the process is
/// expected to treat it as fatal.
pub fn get_config(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Yaml::file_exact(path))
        .merge(Env::prefixed("K9_"));

    figment
        .extract()
        .map_err(|err| ConfigError::ParseError(err.to_string()))
}
