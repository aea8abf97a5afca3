use crate::error::{EdenError, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    let path = path.trim();
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    } else if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    PathBuf::from(path)
}

/// Root for per-checkout state such as overlay directories.
pub fn get_state_dir() -> Result<PathBuf> {
    if let Ok(state_dir) = std::env::var("EDENFS_STATE_DIR") {
        return Ok(expand_tilde(&state_dir));
    }

    let project_dirs = ProjectDirs::from("com", "edenfs", "edenfs")
        .ok_or_else(|| EdenError::Config("Could not determine state directory".to_string()))?;

    Ok(project_dirs.data_local_dir().to_path_buf())
}

pub fn default_overlay_dir(checkout_name: &str) -> Result<PathBuf> {
    if checkout_name.is_empty() || checkout_name.contains('/') {
        return Err(EdenError::Config(format!(
            "Invalid checkout name '{}'",
            checkout_name
        )));
    }
    Ok(get_state_dir()?.join("clients").join(checkout_name).join("local"))
}
