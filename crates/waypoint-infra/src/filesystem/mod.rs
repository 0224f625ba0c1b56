//! Data directory layout for Waypoint.
//!
//! The data directory holds the journal database and `config.toml`.

use std::path::{Path, PathBuf};

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "WAYPOINT_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `WAYPOINT_DATA_DIR` environment variable
/// 2. `~/.waypoint` in the user's home directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".waypoint");
    }

    // Last resort: current directory
    PathBuf::from(".waypoint")
}

/// Create the data directory (and parents) if it does not exist yet.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(data_dir).await?;
    tracing::debug!(path = %data_dir.display(), "data directory ready");
    Ok(())
}
