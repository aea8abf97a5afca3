//! Per-checkout coordinator.
//!
//! `EdenMount` owns the overlay, the inode map, the journal, and the rename
//! lock. Structural mutations go through it so that each one runs under the
//! exclusive rename lock, writes through to the catalog, and appends exactly
//! one journal delta before the lock is released.

pub mod rename_lock;

pub use rename_lock::{RenameLock, RenameMutex, SharedRenameLock};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

use crate::config::{validate_config, BindMount, MountConfig};
use crate::error::{EdenError, Result};
use crate::inodes::{ChildEntry, Inode, InodeMap};
use crate::journal::{Journal, JournalDelta, PathChange};
use crate::overlay::Overlay;
use crate::store::BackingStore;
use crate::types::{InodeKind, InodeNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Running,
    /// `destroy` has started; waiting for outstanding references.
    Draining,
    /// The overlay is closed.
    Destroyed,
}

pub struct EdenMount {
    config: MountConfig,
    overlay: Arc<Overlay>,
    inode_map: InodeMap,
    journal: Journal,
    rename: Arc<RenameMutex>,
    generation: u64,
    state: Arc<watch::Sender<MountState>>,
    destroying: AtomicBool,
}

impl EdenMount {
    /// Open the overlay (running fsck if needed) and bring up the root inode.
    pub fn new(config: MountConfig, store: Arc<dyn BackingStore>) -> Result<Arc<Self>> {
        validate_config(&config)?;

        let overlay = Arc::new(Overlay::open(&config.overlay_dir, &config.overlay)?);
        let rename = Arc::new(RenameMutex::new());
        let inode_map = InodeMap::new(Arc::clone(&overlay), store, Arc::clone(&rename));

        // The mount keeps one reference on the root until destroy.
        let root = overlay
            .ensure_root(config.snapshot)
            .and_then(|_| inode_map.load(InodeNumber::ROOT));
        if let Err(e) = root {
            if let Err(close_err) = overlay.close() {
                tracing::warn!("Failed to close overlay after mount error: {}", close_err);
            }
            return Err(e);
        }

        let (state, _) = watch::channel(MountState::Running);
        let journal = Journal::new(config.journal.get_max_deltas());
        let mount = EdenMount {
            config,
            overlay,
            inode_map,
            journal,
            rename,
            generation: next_generation(),
            state: Arc::new(state),
            destroying: AtomicBool::new(false),
        };
        tracing::info!(
            "Mounted {} (generation {:#x})",
            mount.config.mount_path.display(),
            mount.generation
        );
        Ok(Arc::new(mount))
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    pub fn inode_map(&self) -> &InodeMap {
        &self.inode_map
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn bind_mounts(&self) -> &[BindMount] {
        &self.config.bind_mounts
    }

    /// Distinguishes this instantiation from earlier mounts of the checkout.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> MountState {
        *self.state.borrow()
    }

    pub fn rename_mutex(&self) -> &RenameMutex {
        &self.rename
    }

    pub fn acquire_rename_lock(&self) -> RenameLock<'_> {
        self.rename.acquire()
    }

    pub fn acquire_shared_rename_lock(&self) -> SharedRenameLock<'_> {
        self.rename.acquire_shared()
    }

    /// The root tree, with one reference owned by the caller.
    pub fn root_inode(&self) -> Result<Arc<Inode>> {
        self.inode_map.load(InodeNumber::ROOT)
    }

    /// Hand back a reference obtained from this mount.
    pub fn release(&self, inode: &Inode) -> Result<()> {
        self.inode_map.release(inode.number())
    }

    /// Walk `path` from the root under the shared rename lock. The returned
    /// inode carries one reference owned by the caller.
    pub fn resolve_path(&self, path: &str) -> Result<Arc<Inode>> {
        let _lock = self.acquire_shared_rename_lock();
        let components = split_path(path)?;

        let mut current = self.inode_map.load(InodeNumber::ROOT)?;
        let mut walked = PathBuf::new();
        for component in components {
            let next = if current.is_tree() {
                self.inode_map
                    .lookup_child(&current, component)
                    .and_then(|child| self.inode_map.load(child.number))
            } else {
                Err(EdenError::NotADirectory(walked.display().to_string()))
            };
            self.inode_map.release_logged(current.number());
            walked.push(component);
            current = next.map_err(|e| match e {
                EdenError::NotFound(_) => EdenError::NotFound(walked.display().to_string()),
                other => other,
            })?;
        }
        Ok(current)
    }

    pub fn get_tree_inode(&self, path: &str) -> Result<Arc<Inode>> {
        let inode = self.resolve_path(path)?;
        if !inode.is_tree() {
            self.inode_map.release_logged(inode.number());
            return Err(EdenError::NotADirectory(path.to_string()));
        }
        Ok(inode)
    }

    pub fn get_file_inode(&self, path: &str) -> Result<Arc<Inode>> {
        let inode = self.resolve_path(path)?;
        if inode.is_tree() {
            self.inode_map.release_logged(inode.number());
            return Err(EdenError::IsADirectory(path.to_string()));
        }
        Ok(inode)
    }

    /// Create an empty file or tree named `name` under `parent`.
    pub fn create(&self, parent: InodeNumber, name: &str, kind: InodeKind) -> Result<InodeNumber> {
        validate_name(name)?;
        let lock = self.acquire_rename_lock();
        let dir = self.inode_map.load(parent)?;
        let result = self.create_locked(&lock, &dir, name, kind);
        self.inode_map.release_logged(parent);
        result
    }

    /// Remove `name` from `parent`. Trees must be empty.
    pub fn unlink(&self, parent: InodeNumber, name: &str) -> Result<()> {
        validate_name(name)?;
        let lock = self.acquire_rename_lock();
        let dir = self.inode_map.load(parent)?;
        let result = self.unlink_locked(&lock, &dir, name);
        self.inode_map.release_logged(parent);
        result
    }

    /// Move `parent/name` to `new_parent/new_name`, replacing a file or an
    /// empty tree already at the destination.
    pub fn rename(
        &self,
        parent: InodeNumber,
        name: &str,
        new_parent: InodeNumber,
        new_name: &str,
    ) -> Result<()> {
        validate_name(name)?;
        validate_name(new_name)?;
        let lock = self.acquire_rename_lock();
        let src = self.inode_map.load(parent)?;
        let dst = match self.inode_map.load(new_parent) {
            Ok(dst) => dst,
            Err(e) => {
                self.inode_map.release_logged(parent);
                return Err(e);
            }
        };
        let result = self.rename_locked(&lock, &src, name, &dst, new_name);
        self.inode_map.release_logged(new_parent);
        self.inode_map.release_logged(parent);
        result
    }

    /// Switch a file to overlay-local content. The row is rewritten when the
    /// last reference is released; if that write fails the error is returned
    /// and no journal entry is recorded.
    pub fn materialize_file(&self, number: InodeNumber) -> Result<()> {
        let _lock = self.acquire_shared_rename_lock();
        let inode = self.inode_map.load(number)?;
        let path = if inode.is_tree() {
            Err(EdenError::IsADirectory(format!("inode {}", number)))
        } else {
            inode.materialize_content();
            if inode.is_unlinked() {
                Ok(None)
            } else {
                self.overlay.path_of(number).map(Some)
            }
        };
        let released = self.inode_map.release(number);
        let path = path?;
        released?;
        if let Some(path) = path {
            self.record(vec![PathChange::Modified { path }]);
        }
        Ok(())
    }

    /// Drain and close the mount.
    ///
    /// New loads fail with `MountShuttingDown` from the first call on. The
    /// returned future completes once every outstanding reference has been
    /// released and the overlay is closed. Calling it again waits for the same
    /// completion.
    pub async fn destroy(&self) {
        if !self.destroying.swap(true, Ordering::SeqCst) {
            tracing::info!("Destroying mount {}", self.config.mount_path.display());
            self.state.send_replace(MountState::Draining);

            let overlay = Arc::clone(&self.overlay);
            let state = Arc::clone(&self.state);
            self.inode_map.begin_shutdown(Box::new(move || {
                if let Err(e) = overlay.close() {
                    tracing::error!("Failed to close overlay: {}", e);
                }
                state.send_replace(MountState::Destroyed);
                tracing::info!("Mount destroyed");
            }));
            self.inode_map.release_logged(InodeNumber::ROOT);
        }

        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == MountState::Destroyed).await;
    }

    fn create_locked(
        &self,
        lock: &RenameLock<'_>,
        dir: &Inode,
        name: &str,
        kind: InodeKind,
    ) -> Result<InodeNumber> {
        self.inode_map.materialize(dir)?;
        let path = self.path_in(dir, name)?;
        if dir.child(name).is_some() {
            return Err(EdenError::AlreadyExists(path.display().to_string()));
        }

        let inode = self.inode_map.allocate(lock, dir.number(), name, kind)?;
        let number = inode.number();
        dir.insert_child(name, ChildEntry { number, kind });
        self.record(vec![PathChange::Created { path }]);
        self.inode_map.release_logged(number);
        Ok(number)
    }

    fn unlink_locked(&self, lock: &RenameLock<'_>, dir: &Inode, name: &str) -> Result<()> {
        debug_assert!(lock.holds(&self.rename));
        let child = self.inode_map.lookup_child(dir, name)?;
        let path = self.path_in(dir, name)?;

        let inode = self.inode_map.load(child.number)?;
        let detached = self.detach(dir, &inode, name);
        self.inode_map.release_logged(child.number);
        detached?;

        self.record(vec![PathChange::Removed { path }]);
        Ok(())
    }

    fn rename_locked(
        &self,
        lock: &RenameLock<'_>,
        src: &Inode,
        name: &str,
        dst: &Inode,
        new_name: &str,
    ) -> Result<()> {
        debug_assert!(lock.holds(&self.rename));
        let child = self.inode_map.lookup_child(src, name)?;
        self.inode_map.materialize(dst)?;
        if src.number() == dst.number() && name == new_name {
            return Ok(());
        }
        if child.kind == InodeKind::Tree && self.is_within(dst.number(), child.number)? {
            return Err(EdenError::InvalidArgument(format!(
                "cannot move '{}' into its own subtree",
                name
            )));
        }

        let from = self.path_in(src, name)?;
        let to = self.path_in(dst, new_name)?;

        let moving = self.inode_map.load(child.number)?;
        let moved = self.move_entry(src, name, dst, new_name, &moving, &to);
        self.inode_map.release_logged(child.number);
        moved?;

        self.record(vec![PathChange::Renamed { from, to }]);
        Ok(())
    }

    fn move_entry(
        &self,
        src: &Inode,
        name: &str,
        dst: &Inode,
        new_name: &str,
        moving: &Inode,
        to: &Path,
    ) -> Result<()> {
        if let Some(existing) = dst.child(new_name) {
            match (moving.kind(), existing.kind) {
                (InodeKind::File, InodeKind::Tree) => {
                    return Err(EdenError::IsADirectory(to.display().to_string()))
                }
                (InodeKind::Tree, InodeKind::File) => {
                    return Err(EdenError::NotADirectory(to.display().to_string()))
                }
                _ => {}
            }
            let victim = self.inode_map.load(existing.number)?;
            let detached = self.detach(dst, &victim, new_name);
            self.inode_map.release_logged(existing.number);
            detached?;
        }

        let mut entry = moving.to_entry();
        entry.parent = Some(dst.number());
        entry.name = new_name.to_string();
        self.overlay.write_entry(&entry)?;

        moving.set_location(Some(dst.number()), new_name);
        let child = ChildEntry {
            number: moving.number(),
            kind: moving.kind(),
        };
        src.remove_child(name);
        dst.insert_child(new_name, child);
        Ok(())
    }

    /// Unlink `inode` from `dir`. The row stays, parentless, until the last
    /// reference is released.
    fn detach(&self, dir: &Inode, inode: &Inode, name: &str) -> Result<()> {
        if inode.is_tree() {
            self.inode_map.materialize(inode)?;
            if inode.children().is_some_and(|children| !children.is_empty()) {
                return Err(EdenError::NotEmpty(name.to_string()));
            }
        }

        let mut entry = inode.to_entry();
        entry.parent = None;
        self.overlay.write_entry(&entry)?;

        inode.set_location(None, name);
        dir.remove_child(name);
        Ok(())
    }

    /// Whether `number` is `ancestor` or lies below it.
    fn is_within(&self, number: InodeNumber, ancestor: InodeNumber) -> Result<bool> {
        let mut current = Some(number);
        while let Some(n) = current {
            if n == ancestor {
                return Ok(true);
            }
            if n.is_root() {
                break;
            }
            current = self.overlay.read_entry(n)?.and_then(|entry| entry.parent);
        }
        Ok(false)
    }

    fn path_in(&self, dir: &Inode, name: &str) -> Result<PathBuf> {
        if dir.is_unlinked() {
            return Err(EdenError::NotFound(format!("inode {} was removed", dir.number())));
        }
        Ok(self.overlay.path_of(dir.number())?.join(name))
    }

    fn record(&self, changes: Vec<PathChange>) -> u64 {
        self.journal
            .append(JournalDelta::new(self.config.snapshot, changes))
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(EdenError::InvalidPath(path.to_string())),
            c if c.contains('\0') => return Err(EdenError::InvalidPath(path.to_string())),
            c => components.push(c),
        }
    }
    Ok(components)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(EdenError::InvalidPath(name.to_string()));
    }
    Ok(())
}

fn next_generation() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    (u64::from(std::process::id()) << 48) ^ nanos ^ COUNTER.fetch_add(1, Ordering::Relaxed)
}
