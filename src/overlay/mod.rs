//! Persistent overlay for locally modified entries.
//!
//! The overlay owns one catalog for the lifetime of a mount: it locks the
//! overlay directory, runs fsck when the previous session did not shut down
//! cleanly, and writes the clean-shutdown marker on close.

pub mod buffered;
pub mod catalog;
pub mod fsck;
pub mod sqlite;

pub use buffered::{BufferSettings, BufferedCatalog};
pub use catalog::{CatalogOp, InodeCatalog, ScannedRecord};
pub use fsck::{
    AllocatorGap, CorruptRecord, DuplicateName, FsckReport, FsckScanner, Orphan, OrphanReason,
    RepairSummary, LOST_AND_FOUND,
};
pub use sqlite::{SqliteCatalog, CATALOG_FILE_NAME};

use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{CatalogKind, OverlayConfig};
use crate::error::{EdenError, Result};
use crate::types::{ContentRef, InodeKind, InodeNumber, ObjectId, OverlayEntry};

pub const LOCK_FILE_NAME: &str = "lock";

pub struct Overlay {
    dir: Option<PathBuf>,
    catalog: Arc<dyn InodeCatalog>,
    /// Direct catalog underneath `catalog`, used for the shutdown marker.
    marker: Option<Arc<SqliteCatalog>>,
    lock_file: Mutex<Option<File>>,
    last_fsck: Option<FsckReport>,
    corrupted: AtomicBool,
    lost_writes: AtomicBool,
    closed: AtomicBool,
}

impl Overlay {
    /// Open (or create) the overlay stored in `dir`.
    pub fn open(dir: &Path, config: &OverlayConfig) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            EdenError::Io(format!(
                "Failed to create overlay directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        let lock_file = lock_overlay_dir(dir)?;

        let sqlite = Arc::new(SqliteCatalog::open(dir.join(CATALOG_FILE_NAME))?);
        let fresh = sqlite.is_fresh()?;
        let clean = sqlite.clean_shutdown()?;

        let last_fsck = if !fresh && (config.force_fsck || !clean) {
            if !clean {
                tracing::warn!(
                    "Overlay {} was not shut down cleanly, running fsck",
                    dir.display()
                );
            }
            Some(FsckScanner::check_and_repair(sqlite.as_ref())?)
        } else {
            None
        };

        // Cleared before any request is served: a crash from here on leaves
        // the marker absent.
        sqlite.set_clean_shutdown(false)?;

        let catalog: Arc<dyn InodeCatalog> = match config.catalog {
            CatalogKind::Direct => sqlite.clone(),
            CatalogKind::Buffered => Arc::new(BufferedCatalog::new(
                sqlite.clone(),
                config.buffer_settings(),
            )?),
        };

        tracing::info!(
            "Opened overlay {} ({} catalog)",
            dir.display(),
            config.catalog
        );

        Ok(Overlay {
            dir: Some(dir.to_path_buf()),
            catalog,
            marker: Some(sqlite),
            lock_file: Mutex::new(Some(lock_file)),
            last_fsck,
            corrupted: AtomicBool::new(false),
            lost_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Wrap a catalog that has no directory or shutdown marker of its own.
    pub fn from_catalog(catalog: Arc<dyn InodeCatalog>) -> Self {
        Overlay {
            dir: None,
            catalog,
            marker: None,
            lock_file: Mutex::new(None),
            last_fsck: None,
            corrupted: AtomicBool::new(false),
            lost_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn catalog(&self) -> &dyn InodeCatalog {
        self.catalog.as_ref()
    }

    /// Report of the fsck run during open, if one ran.
    pub fn last_fsck(&self) -> Option<&FsckReport> {
        self.last_fsck.as_ref()
    }

    /// Whether fsck validated this overlay during the current session.
    pub fn is_certified(&self) -> bool {
        self.last_fsck.is_some()
    }

    /// Flag the overlay so the next open runs fsck regardless of how this
    /// session ends.
    pub fn note_corruption(&self) {
        if !self.corrupted.swap(true, Ordering::SeqCst) {
            tracing::error!("Overlay corruption detected, fsck will run on next open");
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::SeqCst)
    }

    /// Flag a write that the catalog rejected and that nothing retried
    /// successfully. Like corruption, this withholds the clean marker.
    pub fn note_write_failure(&self) {
        if !self.lost_writes.swap(true, Ordering::SeqCst) {
            tracing::error!("Overlay write failed, fsck will run on next open");
        }
    }

    pub fn has_write_failure(&self) -> bool {
        self.lost_writes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn allocate_next(&self) -> Result<InodeNumber> {
        self.checked(self.catalog.allocate_next())
    }

    pub fn write_entry(&self, entry: &OverlayEntry) -> Result<()> {
        self.checked(self.catalog.write_entry(entry))
    }

    pub fn read_entry(&self, number: InodeNumber) -> Result<Option<OverlayEntry>> {
        self.checked(self.catalog.read_entry(number))
    }

    pub fn remove_entry(&self, number: InodeNumber) -> Result<()> {
        self.checked(self.catalog.remove_entry(number))
    }

    pub fn list_children(&self, parent: InodeNumber) -> Result<Vec<OverlayEntry>> {
        self.checked(self.catalog.list_children(parent))
    }

    /// Write the root entry if the catalog has none and return it.
    pub fn ensure_root(&self, snapshot: Option<ObjectId>) -> Result<OverlayEntry> {
        if let Some(root) = self.read_entry(InodeNumber::ROOT)? {
            return Ok(root);
        }
        let content = snapshot.map_or(ContentRef::Local, ContentRef::Backing);
        let root = OverlayEntry::new(InodeNumber::ROOT, None, "", InodeKind::Tree, content);
        self.write_entry(&root)?;
        tracing::debug!("Created overlay root ({})", content.encode());
        Ok(root)
    }

    /// Relative path of an inode, following parent links up to the root.
    pub fn path_of(&self, number: InodeNumber) -> Result<PathBuf> {
        let mut names = Vec::new();
        let mut current = number;
        while !current.is_root() {
            let entry = self
                .read_entry(current)?
                .ok_or_else(|| EdenError::NotFound(format!("inode {}", current)))?;
            let parent = entry
                .parent
                .ok_or_else(|| EdenError::NotFound(format!("inode {} is unlinked", current)))?;
            names.push(entry.name);
            if names.len() > MAX_PATH_DEPTH {
                self.note_corruption();
                return Err(EdenError::CatalogCorrupt(format!(
                    "parent chain of inode {} does not reach the root",
                    number
                )));
            }
            current = parent;
        }
        Ok(names.iter().rev().collect())
    }

    /// Flush and close the catalog. The clean-shutdown marker is written only
    /// when no mutation was lost and no corruption was seen.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let flushed = self.catalog.flush();
        let clean = flushed.is_ok()
            && !self.catalog.has_failed()
            && !self.is_corrupted()
            && !self.has_write_failure();
        let marked = match &self.marker {
            Some(marker) if clean => marker.set_clean_shutdown(true),
            Some(_) => {
                tracing::warn!("Overlay closed without clean-shutdown marker");
                Ok(())
            }
            None => Ok(()),
        };
        let closed = self.catalog.close();

        if let Some(file) = self.lock_file.lock().take() {
            if let Err(e) = FileExt::unlock(&file) {
                tracing::warn!("Failed to unlock overlay directory: {}", e);
            }
        }

        flushed?;
        marked?;
        closed?;
        tracing::info!("Overlay closed");
        Ok(())
    }

    fn checked<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(EdenError::CatalogCorrupt(_)) = &result {
            self.note_corruption();
        }
        result
    }
}

/// Upper bound on directory nesting used to stop walks over a damaged catalog.
const MAX_PATH_DEPTH: usize = 4096;

/// Take the exclusive advisory lock on an overlay directory.
pub fn lock_overlay_dir(dir: &Path) -> Result<File> {
    let path = dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| EdenError::Io(format!("Failed to open {}: {}", path.display(), e)))?;
    file.try_lock_exclusive()
        .map_err(|_| EdenError::OverlayLocked(dir.to_path_buf()))?;
    Ok(file)
}
