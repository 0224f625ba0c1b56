//! Engine configuration types for Waypoint.
//!
//! `EngineConfig` represents the top-level `config.toml` in the data
//! directory. Every field has a default so an empty or missing file works.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite journal file name, relative to the data directory.
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Capacity of the workflow event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Resume unfinished workflows when the engine starts.
    #[serde(default = "default_recover_on_start")]
    pub recover_on_start: bool,

    /// Seconds a driver lease stays valid without renewal. Another process
    /// may take over an instance once its lease lapses.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_database_file() -> String {
    "waypoint.db".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

fn default_recover_on_start() -> bool {
    true
}

fn default_lease_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
            event_capacity: default_event_capacity(),
            recover_on_start: default_recover_on_start(),
            lease_secs: default_lease_secs(),
        }
    }
}
