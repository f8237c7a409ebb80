//! User configuration location for collab-sync.
//!
//! User config location: $XDG_CONFIG_HOME/collab-sync/collab-sync.toml
//! Fallback: the platform config directory (e.g. ~/.config on Linux)

use std::path::PathBuf;

const APP_DIR: &str = "collab-sync";
const FILE_NAME: &str = "collab-sync.toml";

/// Returns the path to the user configuration file.
///
/// Returns None if no config directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    if let Some(xdg_config) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg_config).join(APP_DIR).join(FILE_NAME));
    }

    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(FILE_NAME))
}
