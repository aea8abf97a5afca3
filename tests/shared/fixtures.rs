//! Checkout fixtures shared by the integration and CLI tests.

use edenfs::overlay::{Overlay, CATALOG_FILE_NAME};
use edenfs::{
    ContentRef, EdenMount, Inode, InodeKind, InodeNumber, MemoryStore, MountConfig, ObjectId,
    TreeEntry,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Get the path to the edenfs binary for testing.
#[allow(dead_code)]
pub fn get_edenfs_path() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("edenfs").to_path_buf()
}

/// Temporary checkout backed by an in-memory store.
///
/// The committed snapshot contains:
///
/// ```text
/// README.md
/// docs/
/// src/lib.rs
/// src/main.rs
/// ```
#[allow(dead_code)]
pub struct TestCheckout {
    pub temp_dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub snapshot: ObjectId,
}

impl Default for TestCheckout {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl TestCheckout {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let readme = MemoryStore::blob_id(b"# demo\n");
        let main = MemoryStore::blob_id(b"fn main() {}\n");
        let lib = MemoryStore::blob_id(b"pub fn answer() -> u32 { 42 }\n");

        let src = store.add_tree(vec![
            TreeEntry::new("main.rs", InodeKind::File, main),
            TreeEntry::new("lib.rs", InodeKind::File, lib),
        ]);
        let docs = store.add_tree(vec![]);
        let snapshot = store.add_tree(vec![
            TreeEntry::new("README.md", InodeKind::File, readme),
            TreeEntry::new("src", InodeKind::Tree, src),
            TreeEntry::new("docs", InodeKind::Tree, docs),
        ]);

        TestCheckout {
            temp_dir: tempfile::tempdir().expect("Failed to create temp dir"),
            store: Arc::new(store),
            snapshot,
        }
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.temp_dir.path().join("overlay")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.overlay_dir().join(CATALOG_FILE_NAME)
    }

    pub fn config(&self) -> MountConfig {
        MountConfig::new(self.temp_dir.path().join("mnt"), self.overlay_dir())
            .with_snapshot(self.snapshot)
    }

    pub fn mount(&self) -> Arc<EdenMount> {
        self.mount_with(self.config())
    }

    pub fn mount_with(&self, config: MountConfig) -> Arc<EdenMount> {
        EdenMount::new(config, self.store.clone()).expect("Failed to mount checkout")
    }
}

/// Tree as seen through the mount, enumerating every directory.
#[allow(dead_code)]
pub fn mounted_tree(mount: &EdenMount) -> BTreeMap<PathBuf, InodeKind> {
    let mut tree = BTreeMap::new();
    let root = mount.root_inode().unwrap();
    walk_mounted(mount, &root, PathBuf::new(), &mut tree);
    mount.release(&root).unwrap();
    tree
}

fn walk_mounted(
    mount: &EdenMount,
    dir: &Inode,
    prefix: PathBuf,
    tree: &mut BTreeMap<PathBuf, InodeKind>,
) {
    mount.inode_map().materialize(dir).unwrap();
    for (name, child) in dir.children().unwrap() {
        let path = prefix.join(&name);
        tree.insert(path.clone(), child.kind);
        if child.kind == InodeKind::Tree {
            let inode = mount.inode_map().load(child.number).unwrap();
            walk_mounted(mount, &inode, path, tree);
            mount.release(&inode).unwrap();
        }
    }
}

/// Tree reconstructed from catalog rows alone.
#[allow(dead_code)]
pub fn catalog_tree(overlay: &Overlay) -> BTreeMap<PathBuf, InodeKind> {
    let mut tree = BTreeMap::new();
    walk_catalog(overlay, InodeNumber::ROOT, PathBuf::new(), &mut tree);
    tree
}

fn walk_catalog(
    overlay: &Overlay,
    parent: InodeNumber,
    prefix: PathBuf,
    tree: &mut BTreeMap<PathBuf, InodeKind>,
) {
    for entry in overlay.list_children(parent).unwrap() {
        let path = prefix.join(&entry.name);
        tree.insert(path.clone(), entry.kind);
        if entry.is_tree() {
            walk_catalog(overlay, entry.number, path, tree);
        }
    }
}

/// Write a raw row into a closed overlay catalog.
#[allow(dead_code)]
pub fn inject_row(
    db: &Path,
    number: u64,
    parent: Option<u64>,
    name: &str,
    kind: InodeKind,
    content: ContentRef,
) {
    let conn = rusqlite::Connection::open(db).unwrap();
    conn.execute(
        "INSERT OR REPLACE INTO inodes (number, parent, name, kind, content)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            number as i64,
            parent.map(|p| p as i64),
            name,
            kind.as_str(),
            content.encode()
        ],
    )
    .unwrap();
}

/// Run arbitrary SQL against a closed overlay catalog.
#[allow(dead_code)]
pub fn execute_sql(db: &Path, sql: &str) {
    let conn = rusqlite::Connection::open(db).unwrap();
    conn.execute_batch(sql).unwrap();
}
