use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

/// Static application configuration read from `settings.json`.
///
/// Everything here is a deployment-time knob, not server-controlled state;
/// the remote config document overrides some of these at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_true")]
    pub enable_updates: bool,

    #[serde(default)]
    pub fallback_updater_feed_url: Option<String>,

    /// Comma-separated remote config hosts, round-robin selected.
    #[serde(default = "default_ecs_hosts")]
    pub ecs_hosts: String,

    #[serde(default = "default_ecs_path_template")]
    pub ecs_path_template: String,

    /// Build channel reported to the config and feed endpoints.
    #[serde(default = "default_ring")]
    pub ring: String,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,

    /// Polling cadence override in seconds; the remote config's own
    /// interval still wins when present.
    #[serde(default)]
    pub update_interval_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_ecs_hosts() -> String {
    "config.petrel.example.com".to_owned()
}

fn default_ecs_path_template() -> String {
    "/config/v1/petrel/{channel}/{platform}/{version}/{deviceId}".to_owned()
}

fn default_ring() -> String {
    "production".to_owned()
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            enable_updates: true,
            fallback_updater_feed_url: None,
            ecs_hosts: default_ecs_hosts(),
            ecs_path_template: default_ecs_path_template(),
            ring: default_ring(),
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
            update_interval_secs: None,
        }
    }
}

impl AppConfig {
    /// Load configuration, falling back to defaults when the file is
    /// missing or unreadable.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!("Error reading {}: {error}", path.display());
                }
                return Self::default();
            }
        };
        match serde_json::from_str(&json) {
            Ok(config) => config,
            Err(error) => {
                warn!("Error parsing {}: {error}", path.display());
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        self.ecs_hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_owned)
            .collect()
    }
}
