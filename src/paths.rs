//! Centralized path utilities for the application.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Get the default root data directory (~/.subfleet).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".subfleet")
}

/// Get the default path to the config file.
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

/// Get the path to the instance store file.
pub fn store_path(data_dir: &Path) -> PathBuf {
    data_dir.join("instances.toml")
}

/// Ensure all required data directories exist.
pub fn ensure_data_dirs(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir).map_err(|e| AppError::io(e.to_string()))?;

    let dirs = [subs_dir(data_dir), cache_dir(data_dir)];
    for dir in &dirs {
        fs::create_dir_all(dir).map_err(|e| AppError::io(e.to_string()))?;
    }
    Ok(())
}

/// Directory holding every instance workspace.
pub fn subs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("subs")
}

/// Download cache for template archives.
pub fn cache_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("cache")
}

/// Get the provisioned workspace directory for an instance.
pub fn workspace_dir(data_dir: &Path, instance_id: &str) -> PathBuf {
    subs_dir(data_dir).join(instance_id)
}

/// Check if an instance already has a workspace on disk.
pub fn is_workspace_provisioned(data_dir: &Path, instance_id: &str) -> bool {
    workspace_dir(data_dir, instance_id).is_dir()
}
