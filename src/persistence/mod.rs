//! # Persistence Module
//!
//! Local files owned by the dashboard. Only two things are persisted: the
//! application config (see [`crate::config`]) and the API token. Device state
//! and readings are never written to disk.
//!
//! Both live under `~/.config/mqttdash/`. File operations use `tokio::fs` and
//! report failures as `color_eyre` reports; a missing file is never an error.

pub mod token_store;

pub use token_store::TokenStore;

use std::path::PathBuf;
use tracing::warn;

pub const CONFIG_DIR: &str = ".config/mqttdash";

pub fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

/// `~/.config/mqttdash`
pub fn config_dir() -> PathBuf {
    get_home_dir().join(CONFIG_DIR)
}
