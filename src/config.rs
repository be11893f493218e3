//! Daemon configuration.
//!
//! `AppConfig` is read once from the environment at startup; `SyncConfig`
//! is the runtime-tunable subset the sync engine accepts over its command
//! channel.

use crate::services::token_manager::OAuthConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default sync interval in seconds (10 minutes).
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 600;

/// Default upstream request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default ceiling on concurrent sync runs (scheduled + manual).
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 5;

/// Runtime-tunable sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Sync interval in seconds.
    pub interval_secs: u64,

    /// Upstream request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Ceiling on concurrent sync runs.
    pub max_concurrent_runs: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
        }
    }
}

/// Process-level configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// OAuth application credentials for the token refresh exchange.
    pub oauth: OAuthConfig,

    /// Initial sync engine configuration.
    pub sync: SyncConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    /// Load configuration from `MIRROR_*` environment variables, falling
    /// back to defaults suitable for local use.
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("MIRROR_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("gitlab-mirror.db")),
            oauth: OAuthConfig {
                client_id: std::env::var("MIRROR_OAUTH_CLIENT_ID").unwrap_or_default(),
                client_secret: std::env::var("MIRROR_OAUTH_CLIENT_SECRET").unwrap_or_default(),
            },
            sync: SyncConfig {
                interval_secs: env_parse("MIRROR_SYNC_INTERVAL_SECS", DEFAULT_SYNC_INTERVAL_SECS),
                request_timeout_secs: env_parse(
                    "MIRROR_REQUEST_TIMEOUT_SECS",
                    DEFAULT_REQUEST_TIMEOUT_SECS,
                ),
                max_concurrent_runs: env_parse(
                    "MIRROR_MAX_CONCURRENT_RUNS",
                    DEFAULT_MAX_CONCURRENT_RUNS,
                ),
            },
        }
    }
}
