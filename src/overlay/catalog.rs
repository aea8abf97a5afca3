use crate::error::Result;
use crate::types::{InodeNumber, OverlayEntry};

/// A queued or batched catalog mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogOp {
    Write(OverlayEntry),
    Remove(InodeNumber),
    /// Raise the persisted allocator mark to at least this number.
    Allocated(InodeNumber),
}

impl CatalogOp {
    /// The inode whose row this operation touches, if any.
    pub fn target(&self) -> Option<InodeNumber> {
        match self {
            CatalogOp::Write(entry) => Some(entry.number),
            CatalogOp::Remove(number) => Some(*number),
            CatalogOp::Allocated(_) => None,
        }
    }
}

/// One row as seen by a full scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannedRecord {
    Valid(OverlayEntry),
    Corrupt { number: InodeNumber, reason: String },
}

/// Persistence interface for overlay entries.
///
/// Implementations are shared between request threads, so every method takes
/// `&self`.
pub trait InodeCatalog: Send + Sync {
    /// Return a fresh number. The new high-water mark is recorded before the
    /// number is handed out.
    fn allocate_next(&self) -> Result<InodeNumber>;

    /// Upsert the row for `entry.number`.
    fn write_entry(&self, entry: &OverlayEntry) -> Result<()>;

    fn read_entry(&self, number: InodeNumber) -> Result<Option<OverlayEntry>>;

    /// Delete the row. Absent rows are not an error.
    fn remove_entry(&self, number: InodeNumber) -> Result<()>;

    /// Direct children of a tree, ordered by name.
    fn list_children(&self, parent: InodeNumber) -> Result<Vec<OverlayEntry>>;

    /// Highest number ever handed out.
    fn high_water_mark(&self) -> Result<InodeNumber>;

    /// Raise the recorded mark to at least `number`.
    fn record_allocation(&self, number: InodeNumber) -> Result<()>;

    /// Every row, including the ones that no longer decode.
    fn scan_records(&self) -> Result<Vec<ScannedRecord>>;

    fn apply_batch(&self, ops: &[CatalogOp]) -> Result<()> {
        for op in ops {
            match op {
                CatalogOp::Write(entry) => self.write_entry(entry)?,
                CatalogOp::Remove(number) => self.remove_entry(*number)?,
                CatalogOp::Allocated(number) => self.record_allocation(*number)?,
            }
        }
        Ok(())
    }

    /// Block until every accepted mutation is durable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.flush()
    }

    /// Whether a mutation was lost since open.
    fn has_failed(&self) -> bool {
        false
    }
}
