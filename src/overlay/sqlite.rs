//! SQLite-backed direct catalog.
//!
//! Every call is a synchronous, durable statement against the embedded
//! database. This is the correctness baseline the buffered catalog wraps.

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use crate::error::{EdenError, Result};
use crate::overlay::catalog::{CatalogOp, InodeCatalog, ScannedRecord};
use crate::types::{ContentRef, InodeKind, InodeNumber, OverlayEntry};

pub const CATALOG_FILE_NAME: &str = "overlay.db";

const NEXT_INODE_KEY: &str = "next_inode";
const CLEAN_SHUTDOWN_KEY: &str = "clean_shutdown";

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

-- One row per persisted inode
CREATE TABLE IF NOT EXISTS inodes (
    number INTEGER PRIMARY KEY,
    parent INTEGER,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    content TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_inodes_parent ON inodes(parent, name);

-- Allocator high-water mark and clean-shutdown marker
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value
);
"#;

const SELECT_COLUMNS: &str = "SELECT number, parent, name, kind, content FROM inodes";

pub struct SqliteCatalog {
    conn: Mutex<Option<Connection>>,
}

impl SqliteCatalog {
    /// Open or create the catalog database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            EdenError::Catalog(format!("Failed to open {}: {}", path.display(), e))
        })?;
        Self::with_connection(conn)
    }

    /// Create an in-memory catalog (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteCatalog {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or(EdenError::CatalogClosed)?;
        f(conn)
    }

    /// Whether the previous session wrote its clean-shutdown marker.
    pub fn clean_shutdown(&self) -> Result<bool> {
        self.with_conn(|conn| {
            let marker: Option<Value> = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    params![CLEAN_SHUTDOWN_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(marker.is_some())
        })
    }

    pub fn set_clean_shutdown(&self, clean: bool) -> Result<()> {
        self.with_conn(|conn| {
            if clean {
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, unixepoch())",
                    params![CLEAN_SHUTDOWN_KEY],
                )?;
            } else {
                conn.execute(
                    "DELETE FROM meta WHERE key = ?1",
                    params![CLEAN_SHUTDOWN_KEY],
                )?;
            }
            Ok(())
        })
    }

    /// True when nothing has ever been written to this catalog.
    pub fn is_fresh(&self) -> Result<bool> {
        self.with_conn(|conn| {
            let rows: i64 = conn.query_row("SELECT COUNT(*) FROM inodes", [], |row| row.get(0))?;
            let mark: Option<Value> = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    params![NEXT_INODE_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(rows == 0 && mark.is_none())
        })
    }

    pub fn entry_count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let rows: i64 = conn.query_row("SELECT COUNT(*) FROM inodes", [], |row| row.get(0))?;
            Ok(rows as usize)
        })
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
    }
}

fn read_mark(conn: &Connection) -> Result<InodeNumber> {
    let mark: Option<i64> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![NEXT_INODE_KEY],
            |row| row.get(0),
        )
        .optional()?;
    match mark {
        None => Ok(InodeNumber::ROOT),
        Some(v) if v >= InodeNumber::ROOT.get() as i64 => Ok(InodeNumber::new(v as u64)),
        Some(v) => Err(EdenError::CatalogCorrupt(format!(
            "allocator record holds invalid value {}",
            v
        ))),
    }
}

fn raise_mark(conn: &Connection, number: InodeNumber) -> Result<()> {
    let current = read_mark(conn)?;
    if number > current {
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![NEXT_INODE_KEY, number.get() as i64],
        )?;
    }
    Ok(())
}

fn write_row(conn: &Connection, entry: &OverlayEntry) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO inodes (number, parent, name, kind, content)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.number.get() as i64,
            entry.parent.map(|p| p.get() as i64),
            entry.name,
            entry.kind.as_str(),
            entry.content.encode(),
        ],
    )?;
    Ok(())
}

fn remove_row(conn: &Connection, number: InodeNumber) -> Result<()> {
    conn.execute(
        "DELETE FROM inodes WHERE number = ?1",
        params![number.get() as i64],
    )?;
    Ok(())
}

/// Decode one row without letting a bad column abort the whole query.
fn scan_row(row: &Row<'_>) -> rusqlite::Result<ScannedRecord> {
    let number = InodeNumber::new(row.get::<_, i64>(0)? as u64);
    let parent: Value = row.get(1)?;
    let name: Value = row.get(2)?;
    let kind: Value = row.get(3)?;
    let content: Value = row.get(4)?;
    Ok(match decode_values(number, parent, name, kind, content) {
        Ok(entry) => ScannedRecord::Valid(entry),
        Err(reason) => ScannedRecord::Corrupt { number, reason },
    })
}

fn decode_values(
    number: InodeNumber,
    parent: Value,
    name: Value,
    kind: Value,
    content: Value,
) -> std::result::Result<OverlayEntry, String> {
    let parent = match parent {
        Value::Null => None,
        Value::Integer(p) if p > 0 => Some(InodeNumber::new(p as u64)),
        other => return Err(format!("invalid parent column {:?}", other)),
    };
    let name = match name {
        Value::Text(name) => name,
        other => return Err(format!("invalid name column {:?}", other)),
    };
    let kind = match kind {
        Value::Text(kind) => {
            InodeKind::parse(&kind).ok_or_else(|| format!("unknown kind '{}'", kind))?
        }
        other => return Err(format!("invalid kind column {:?}", other)),
    };
    let content = match content {
        Value::Text(content) => ContentRef::decode(&content)
            .ok_or_else(|| format!("unknown content pointer '{}'", content))?,
        other => return Err(format!("invalid content column {:?}", other)),
    };
    Ok(OverlayEntry {
        number,
        parent,
        name,
        kind,
        content,
    })
}

fn expect_valid(record: ScannedRecord) -> Result<OverlayEntry> {
    match record {
        ScannedRecord::Valid(entry) => Ok(entry),
        ScannedRecord::Corrupt { number, reason } => Err(EdenError::CatalogCorrupt(format!(
            "inode {}: {}",
            number, reason
        ))),
    }
}

impl InodeCatalog for SqliteCatalog {
    fn allocate_next(&self) -> Result<InodeNumber> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let next = InodeNumber::new(read_mark(&tx)?.get() + 1);
            raise_mark(&tx, next)?;
            tx.commit()?;
            Ok(next)
        })
    }

    fn write_entry(&self, entry: &OverlayEntry) -> Result<()> {
        self.with_conn(|conn| write_row(conn, entry))
    }

    fn read_entry(&self, number: InodeNumber) -> Result<Option<OverlayEntry>> {
        self.with_conn(|conn| {
            let record = conn
                .query_row(
                    &format!("{} WHERE number = ?1", SELECT_COLUMNS),
                    params![number.get() as i64],
                    scan_row,
                )
                .optional()?;
            record.map(expect_valid).transpose()
        })
    }

    fn remove_entry(&self, number: InodeNumber) -> Result<()> {
        self.with_conn(|conn| remove_row(conn, number))
    }

    fn list_children(&self, parent: InodeNumber) -> Result<Vec<OverlayEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{} WHERE parent = ?1 ORDER BY name",
                SELECT_COLUMNS
            ))?;
            let records = stmt
                .query_map(params![parent.get() as i64], scan_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            records.into_iter().map(expect_valid).collect()
        })
    }

    fn high_water_mark(&self) -> Result<InodeNumber> {
        self.with_conn(|conn| read_mark(conn))
    }

    fn record_allocation(&self, number: InodeNumber) -> Result<()> {
        self.with_conn(|conn| raise_mark(conn, number))
    }

    fn scan_records(&self) -> Result<Vec<ScannedRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} ORDER BY number", SELECT_COLUMNS))?;
            let records = stmt
                .query_map([], scan_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    fn apply_batch(&self, ops: &[CatalogOp]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for op in ops {
                match op {
                    CatalogOp::Write(entry) => write_row(&tx, entry)?,
                    CatalogOp::Remove(number) => remove_row(&tx, *number)?,
                    CatalogOp::Allocated(number) => raise_mark(&tx, *number)?,
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn close(&self) -> Result<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| EdenError::from(e))?;
        }
        Ok(())
    }
}
