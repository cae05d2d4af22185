//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub playback: Option<PlaybackConfig>,
}

/// Dispatch engine tunables
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Interval between conntrack rate recalculations, in seconds
    pub conntrack_interval_secs: u32,
    /// Idle time after which a session is swept from the table, in seconds
    pub session_idle_secs: u64,
    /// Cleaner wake interval, in seconds
    pub cleaner_interval_secs: u64,
    /// Maximum time one plugin may spend on one packet, in seconds
    pub plugin_timeout_secs: u64,
    /// Time to wait for the cleaner to acknowledge shutdown, in seconds
    pub shutdown_wait_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            conntrack_interval_secs: 60,
            session_idle_secs: 600,
            cleaner_interval_secs: 60,
            plugin_timeout_secs: 30,
            shutdown_wait_secs: 10,
        }
    }
}

/// Logging section
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
    /// Output format: pretty, compact, json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Warehouse playback section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackConfig {
    /// Capture file to replay at startup
    pub file: PathBuf,
    /// Remove played-back sessions and conntrack rows afterwards
    #[serde(default = "default_cleanup")]
    pub cleanup: bool,
}

fn default_cleanup() -> bool {
    true
}

/// Generated configuration (config.lock) with all defaults resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLock {
    pub source_hash: String,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
    pub playback: Option<PlaybackConfig>,
}

impl ConfigLock {
    pub fn from_config(config: &Config, source_hash: String) -> Self {
        Self {
            source_hash,
            dispatch: config.dispatch.clone(),
            logging: config.logging.clone(),
            playback: config.playback.clone(),
        }
    }
}
