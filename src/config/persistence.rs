use crate::error::{EdenError, Result};
use std::path::Path;

use crate::config::schema::*;

/// Read and validate a mount config file.
pub fn load_mount_config(path: &Path) -> Result<MountConfig> {
    let toml_content = std::fs::read_to_string(path).map_err(|e| {
        EdenError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let config: MountConfig = toml::from_str(&toml_content)
        .map_err(|e| EdenError::Config(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;
    Ok(config)
}

pub fn save_mount_config(path: &Path, config: &MountConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            EdenError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| EdenError::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, toml_str)
        .map_err(|e| EdenError::Config(format!("Failed to write config file: {}", e)))?;
    Ok(())
}
