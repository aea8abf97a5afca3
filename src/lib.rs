pub mod config;
pub mod error;
pub mod inodes;
pub mod journal;
pub mod mount;
pub mod overlay;
pub mod store;
pub mod types;

pub use config::load_mount_config;
pub use config::save_mount_config;
pub use config::CatalogKind;
pub use config::MountConfig;

pub use error::{EdenError, Result};

pub use inodes::{Inode, InodeMap};
pub use journal::{Journal, JournalDelta, PathChange};
pub use mount::{EdenMount, MountState, RenameLock, SharedRenameLock};
pub use overlay::{FsckReport, FsckScanner, InodeCatalog, Overlay};
pub use store::{BackingStore, MemoryStore, Tree, TreeEntry};
pub use types::{ContentRef, InodeKind, InodeNumber, ObjectId, OverlayEntry};
