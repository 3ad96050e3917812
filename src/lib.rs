//! Crate for the `k9` project
pub mod config;
pub mod http_client;
pub mod logger;
pub mod policy;
pub mod proxy;
pub mod signal;
pub mod tags;

/// Path of the series-submission endpoint whose requests get rewritten.
pub const SERIES_PATH: &str = "/api/v1/series/";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/k9/k9.conf";
pub const DEFAULT_DD_URL: &str = "https://app.datadoghq.com";
pub const DEFAULT_LISTEN_PORT: u16 = 8283;
