pub mod fsck;
pub mod show;

pub use fsck::{run_fsck, EXIT_UNREPAIRABLE};
pub use show::show_overlay;

use edenfs::error::{EdenError, Result};
use edenfs::overlay::{lock_overlay_dir, SqliteCatalog, CATALOG_FILE_NAME};
use std::fs::File;
use std::path::Path;

/// Open an overlay directory without a mount, holding its lock.
fn open_offline(dir: &Path) -> Result<(File, SqliteCatalog)> {
    let db_path = dir.join(CATALOG_FILE_NAME);
    if !db_path.exists() {
        return Err(EdenError::NotFound(format!(
            "No overlay catalog at {}",
            db_path.display()
        )));
    }
    let lock = lock_overlay_dir(dir)?;
    let catalog = SqliteCatalog::open(&db_path)?;
    Ok((lock, catalog))
}
