//! Bootstrap configuration: the handful of settings needed before the
//! catalog database is even reachable. Everything else (remote endpoints,
//! SCP bind address, storage policy) lives in the `SystemConfiguration` and
//! `DicomScpConfig` singleton rows and is loaded through `CatalogRepo` once
//! the pool connects.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::num::NonZeroUsize;

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapSettings {
    pub database_url: String,
    /// Root directory the SCP owns exclusively (spec.md §5 "Shared
    /// resources"), kept out of the catalog since the process must know it
    /// before the database is reachable at all.
    pub scp_storage_root: camino::Utf8PathBuf,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_chain_interval")]
    #[serde(with = "humantime_serde")]
    pub chain_interval: std::time::Duration,
    #[serde(default = "default_stats_interval")]
    #[serde(with = "humantime_serde")]
    pub stats_interval: std::time::Duration,
    #[serde(default = "default_scp_threads")]
    pub scp_threads: NonZeroUsize,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_chain_interval() -> std::time::Duration {
    std::time::Duration::from_secs(60)
}

fn default_stats_interval() -> std::time::Duration {
    std::time::Duration::from_secs(30 * 60)
}

fn default_scp_threads() -> NonZeroUsize {
    NonZeroUsize::new(8).unwrap()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Merge `draw-client.toml` (if present in the working directory) under
/// `DRAW_CLIENT_`-prefixed environment variables, the latter winning.
pub fn load_bootstrap_settings() -> Result<BootstrapSettings, figment::Error> {
    Figment::new()
        .merge(Toml::file("draw-client.toml"))
        .merge(Env::prefixed("DRAW_CLIENT_").split("__"))
        .extract()
}
