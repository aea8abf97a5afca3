use crate::error::{EdenError, Result};
use crate::overlay::BufferSettings;
use crate::types::ObjectId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which catalog implementation backs the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CatalogKind {
    #[default]
    Direct,
    Buffered,
}

impl std::fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogKind::Direct => write!(f, "direct"),
            CatalogKind::Buffered => write!(f, "buffered"),
        }
    }
}

impl std::str::FromStr for CatalogKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(CatalogKind::Direct),
            "buffered" => Ok(CatalogKind::Buffered),
            _ => Err(format!(
                "Invalid catalog value '{}'. Must be one of: direct, buffered",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OverlayConfig {
    #[serde(default)]
    pub catalog: CatalogKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_depth: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_retry_delay_ms: Option<u64>,
    /// Run fsck on open even after a clean shutdown.
    #[serde(default)]
    pub force_fsck: bool,
}

impl OverlayConfig {
    pub fn get_buffer_depth(&self) -> usize {
        self.buffer_depth.unwrap_or_else(super::default_buffer_depth)
    }

    pub fn get_flush_batch_size(&self) -> usize {
        self.flush_batch_size
            .unwrap_or_else(super::default_flush_batch_size)
    }

    pub fn get_flush_max_retries(&self) -> u32 {
        self.flush_max_retries
            .unwrap_or_else(super::default_flush_max_retries)
    }

    pub fn get_flush_retry_delay_ms(&self) -> u64 {
        self.flush_retry_delay_ms
            .unwrap_or_else(super::default_flush_retry_delay_ms)
    }

    pub fn buffer_settings(&self) -> BufferSettings {
        BufferSettings {
            depth: self.get_buffer_depth(),
            batch_size: self.get_flush_batch_size(),
            max_retries: self.get_flush_max_retries(),
            retry_delay: Duration::from_millis(self.get_flush_retry_delay_ms()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JournalConfig {
    /// Deltas retained before the oldest are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deltas: Option<usize>,
}

impl JournalConfig {
    pub fn get_max_deltas(&self) -> usize {
        self.max_deltas
            .unwrap_or_else(super::default_journal_max_deltas)
    }
}

/// A host directory exposed read-only inside the checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub client_path: PathBuf,
    pub mount_path: PathBuf,
}

/// Everything needed to bring up one checkout. Immutable once the mount exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    pub mount_path: PathBuf,
    pub overlay_dir: PathBuf,
    /// Root tree of the checked-out commit. Absent means an empty checkout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ObjectId>,
    #[serde(default)]
    pub bind_mounts: Vec<BindMount>,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

impl MountConfig {
    pub fn new(mount_path: impl Into<PathBuf>, overlay_dir: impl Into<PathBuf>) -> Self {
        MountConfig {
            mount_path: mount_path.into(),
            overlay_dir: overlay_dir.into(),
            snapshot: None,
            bind_mounts: Vec::new(),
            overlay: OverlayConfig::default(),
            journal: JournalConfig::default(),
        }
    }

    pub fn with_snapshot(mut self, snapshot: ObjectId) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

pub fn validate_config(config: &MountConfig) -> Result<()> {
    if config.overlay.get_buffer_depth() == 0 {
        return Err(EdenError::Config(
            "overlay.buffer_depth must be greater than zero".to_string(),
        ));
    }
    if config.overlay.get_flush_batch_size() == 0 {
        return Err(EdenError::Config(
            "overlay.flush_batch_size must be greater than zero".to_string(),
        ));
    }
    if config.journal.get_max_deltas() == 0 {
        return Err(EdenError::Config(
            "journal.max_deltas must be greater than zero".to_string(),
        ));
    }
    for bind in &config.bind_mounts {
        if bind.mount_path.is_absolute() {
            return Err(EdenError::Config(format!(
                "Bind mount target '{}' must be relative to the checkout",
                bind.mount_path.display()
            )));
        }
    }
    Ok(())
}
