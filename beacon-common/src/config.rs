//! Configuration loading
//!
//! Startup configuration resolves in priority order: command-line argument,
//! environment variable (both handled by clap in the binary), TOML config
//! file, compiled default. A missing or unreadable TOML file is not fatal;
//! the server logs a warning and starts with defaults. Runtime-tunable
//! values (sweep interval, mailbox capacity, …) live in the `settings`
//! table instead, see [`crate::db`].

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Startup configuration from the optional TOML config file
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Port the websocket/HTTP listener binds to
    pub port: u16,
    /// Path of the sqlite database file
    pub database: PathBuf,
    /// Default tracing filter when RUST_LOG is unset
    pub log_filter: String,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            port: 5780,
            database: PathBuf::from("beacon.db"),
            log_filter: "beacon_server=debug,beacon_common=info".to_string(),
        }
    }
}

impl TomlConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file is absent or malformed
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Ignoring malformed config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Config file {} not readable ({}), using defaults", path.display(), e);
                Self::default()
            }
        }
    }
}
