//! Resident inode table.
//!
//! Every inode a request thread touches goes through `load` and is handed
//! back with `release`. Loads and evictions of one number are funneled
//! through a single slot, so concurrent callers share one catalog read and
//! always end up with the same `Arc<Inode>`.

use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EdenError, Result};
use crate::inodes::inode::{ChildEntry, Inode, TreeChildren};
use crate::mount::rename_lock::{RenameLock, RenameMutex};
use crate::overlay::Overlay;
use crate::store::BackingStore;
use crate::types::{ContentRef, InodeKind, InodeNumber, OverlayEntry};

/// Runs once when the map has drained after `begin_shutdown`.
pub type ShutdownHook = Box<dyn FnOnce() + Send>;

struct Resident {
    inode: Arc<Inode>,
    refs: usize,
}

/// Outcome of an in-flight load or eviction, shared with every joined caller.
struct PendingLoad {
    result: Mutex<Option<Result<Arc<Inode>>>>,
    done: Condvar,
}

impl PendingLoad {
    fn new() -> Self {
        PendingLoad {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<Arc<Inode>> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut result);
        }
    }

    fn complete(&self, result: Result<Arc<Inode>>) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }
}

struct Slot {
    pending: Arc<PendingLoad>,
    /// Callers waiting on `pending`. Each one is owed a reference.
    joiners: usize,
}

#[derive(Default)]
struct MapState {
    resident: FxHashMap<InodeNumber, Resident>,
    slots: FxHashMap<InodeNumber, Slot>,
    outstanding: usize,
    draining: bool,
    on_drained: Option<ShutdownHook>,
}

impl MapState {
    fn take_drained_hook(&mut self) -> Option<ShutdownHook> {
        if self.draining && self.outstanding == 0 && self.slots.is_empty() {
            self.on_drained.take()
        } else {
            None
        }
    }
}

pub struct InodeMap {
    overlay: Arc<Overlay>,
    store: Arc<dyn BackingStore>,
    rename: Arc<RenameMutex>,
    state: Mutex<MapState>,
}

impl InodeMap {
    pub fn new(
        overlay: Arc<Overlay>,
        store: Arc<dyn BackingStore>,
        rename: Arc<RenameMutex>,
    ) -> Self {
        InodeMap {
            overlay,
            store,
            rename,
            state: Mutex::new(MapState::default()),
        }
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    /// Return the resident instance, loading it first if needed. The caller
    /// owns one reference and must hand it back with [`InodeMap::release`].
    pub fn load(&self, number: InodeNumber) -> Result<Arc<Inode>> {
        let pending = {
            let mut state = self.state.lock();
            if state.draining {
                return Err(EdenError::MountShuttingDown);
            }
            if let Some(resident) = state.resident.get_mut(&number) {
                resident.refs += 1;
                let inode = Arc::clone(&resident.inode);
                state.outstanding += 1;
                return Ok(inode);
            }
            if let Some(slot) = state.slots.get_mut(&number) {
                slot.joiners += 1;
                let pending = Arc::clone(&slot.pending);
                drop(state);
                return pending.wait();
            }
            let pending = Arc::new(PendingLoad::new());
            state.slots.insert(
                number,
                Slot {
                    pending: Arc::clone(&pending),
                    joiners: 0,
                },
            );
            pending
        };

        let fetched = self.fetch(number);

        let (result, hook) = {
            let mut state = self.state.lock();
            let joiners = state.slots.remove(&number).map_or(0, |slot| slot.joiners);
            let result = match fetched {
                Ok(_) if state.draining => {
                    tracing::debug!("Discarding load of inode {} during shutdown", number);
                    Err(EdenError::MountShuttingDown)
                }
                Ok(inode) => {
                    let refs = joiners + 1;
                    state.resident.insert(
                        number,
                        Resident {
                            inode: Arc::clone(&inode),
                            refs,
                        },
                    );
                    state.outstanding += refs;
                    Ok(inode)
                }
                Err(e) => Err(e),
            };
            (result, state.take_drained_hook())
        };

        pending.complete(result.clone());
        if let Some(hook) = hook {
            self.run_drained_hook(hook);
        }
        result
    }

    /// Drop one reference. At zero the inode's dirty state is written to the
    /// catalog (or its row removed, if unlinked) and the inode is evicted.
    pub fn release(&self, number: InodeNumber) -> Result<()> {
        let (inode, pending) = {
            let mut state = self.state.lock();
            let resident = state
                .resident
                .get_mut(&number)
                .filter(|resident| resident.refs > 0)
                .ok_or_else(|| EdenError::InvalidArgument(format!("inode {} is not loaded", number)))?;
            resident.refs -= 1;
            let remaining = resident.refs;
            state.outstanding -= 1;
            if remaining > 0 {
                return Ok(());
            }
            let Some(resident) = state.resident.remove(&number) else {
                return Ok(());
            };
            let pending = Arc::new(PendingLoad::new());
            state.slots.insert(
                number,
                Slot {
                    pending: Arc::clone(&pending),
                    joiners: 0,
                },
            );
            (resident.inode, pending)
        };

        let persisted = self.persist(&inode);
        if let Err(e) = &persisted {
            tracing::error!("Failed to persist inode {} on eviction: {}", number, e);
            self.overlay.note_write_failure();
        }

        let (result, hook) = {
            let mut state = self.state.lock();
            let joiners = state.slots.remove(&number).map_or(0, |slot| slot.joiners);
            // An inode whose state never reached the catalog stays resident
            // with no references and is written again on its next release or
            // at shutdown. Loads that arrived mid-eviction get it back too.
            if joiners > 0 || persisted.is_err() {
                state.resident.insert(
                    number,
                    Resident {
                        inode: Arc::clone(&inode),
                        refs: joiners,
                    },
                );
                state.outstanding += joiners;
            }
            if joiners == 0 && persisted.is_ok() {
                tracing::debug!("Evicted inode {}", number);
            }
            let result = if joiners > 0 {
                Ok(inode)
            } else {
                Err(EdenError::NotFound(format!("inode {} was evicted", number)))
            };
            (result, state.take_drained_hook())
        };

        pending.complete(result);
        if let Some(hook) = hook {
            self.run_drained_hook(hook);
        }
        persisted
    }

    /// Allocate a number for a new entry under `parent`, write its row, and
    /// register it as resident with one reference held by the caller.
    ///
    /// # Panics
    ///
    /// When `lock` was not taken from this map's mount.
    pub fn allocate(
        &self,
        lock: &RenameLock<'_>,
        parent: InodeNumber,
        name: &str,
        kind: InodeKind,
    ) -> Result<Arc<Inode>> {
        assert!(
            lock.holds(&self.rename),
            "allocate called without this mount's rename lock"
        );

        let number = self.overlay.allocate_next()?;
        let entry = OverlayEntry::new(number, Some(parent), name, kind, ContentRef::Local);
        self.overlay.write_entry(&entry)?;

        let children = match kind {
            InodeKind::Tree => Some(TreeChildren::Loaded(BTreeMap::new())),
            InodeKind::File => None,
        };
        let inode = Arc::new(Inode::new(entry, children));

        let mut state = self.state.lock();
        state.resident.insert(
            number,
            Resident {
                inode: Arc::clone(&inode),
                refs: 1,
            },
        );
        state.outstanding += 1;
        tracing::debug!("Allocated inode {} ({}) under {}", number, kind, parent);
        Ok(inode)
    }

    /// Load the child `name` of tree `parent`, enumerating the tree first if
    /// needed.
    pub fn load_child(&self, parent: InodeNumber, name: &str) -> Result<Arc<Inode>> {
        let tree = self.load(parent)?;
        let child = self
            .lookup_child(&tree, name)
            .and_then(|entry| self.load(entry.number));
        self.release_logged(parent);
        child
    }

    /// Find a child by name, enumerating the tree first if needed.
    pub fn lookup_child(&self, tree: &Inode, name: &str) -> Result<ChildEntry> {
        self.materialize(tree)?;
        tree.child(name)
            .ok_or_else(|| EdenError::NotFound(name.to_string()))
    }

    /// Enumerate a tree that is still described by the backing store.
    ///
    /// Catalog rows that already exist under the tree win over store entries
    /// of the same name, so re-running after an interrupted attempt is safe.
    pub fn materialize(&self, tree: &Inode) -> Result<()> {
        let mut state = tree.state();
        let id = match &state.children {
            Some(TreeChildren::Loaded(_)) => return Ok(()),
            Some(TreeChildren::Unloaded(id)) => *id,
            None => {
                return Err(EdenError::NotADirectory(format!(
                    "inode {} is a file",
                    tree.number()
                )))
            }
        };

        let fetched = self.store.get_tree(&id)?;
        let mut children = self.catalog_children(tree.number())?;
        for entry in fetched.entries {
            if children.contains_key(&entry.name) {
                continue;
            }
            let number = self.overlay.allocate_next()?;
            self.overlay.write_entry(&OverlayEntry::new(
                number,
                Some(tree.number()),
                entry.name.clone(),
                entry.kind,
                ContentRef::Backing(entry.id),
            ))?;
            children.insert(
                entry.name,
                ChildEntry {
                    number,
                    kind: entry.kind,
                },
            );
        }

        state.content = ContentRef::Local;
        self.overlay.write_entry(&tree.entry_from(&state))?;
        tracing::debug!(
            "Materialized tree {} ({} children)",
            tree.number(),
            children.len()
        );
        state.children = Some(TreeChildren::Loaded(children));
        Ok(())
    }

    /// Start draining: new loads fail with `MountShuttingDown` and `hook`
    /// runs once the last reference and in-flight load are gone.
    pub fn begin_shutdown(&self, hook: ShutdownHook) {
        let hook = {
            let mut state = self.state.lock();
            state.draining = true;
            state.on_drained = Some(hook);
            state.take_drained_hook()
        };
        if let Some(hook) = hook {
            self.run_drained_hook(hook);
        }
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// The resident instance, without taking a reference.
    pub fn peek(&self, number: InodeNumber) -> Option<Arc<Inode>> {
        self.state
            .lock()
            .resident
            .get(&number)
            .map(|resident| Arc::clone(&resident.inode))
    }

    pub fn ref_count(&self, number: InodeNumber) -> usize {
        self.state
            .lock()
            .resident
            .get(&number)
            .map_or(0, |resident| resident.refs)
    }

    pub fn resident_count(&self) -> usize {
        self.state.lock().resident.len()
    }

    pub fn outstanding_refs(&self) -> usize {
        self.state.lock().outstanding
    }

    pub(crate) fn release_logged(&self, number: InodeNumber) {
        if let Err(e) = self.release(number) {
            tracing::warn!("Release of inode {} failed: {}", number, e);
        }
    }

    fn fetch(&self, number: InodeNumber) -> Result<Arc<Inode>> {
        let entry = self
            .overlay
            .read_entry(number)?
            .ok_or_else(|| EdenError::NotFound(format!("inode {}", number)))?;
        let children = match (entry.kind, entry.content) {
            (InodeKind::Tree, ContentRef::Local) => {
                Some(TreeChildren::Loaded(self.catalog_children(number)?))
            }
            (InodeKind::Tree, ContentRef::Backing(id)) => Some(TreeChildren::Unloaded(id)),
            (InodeKind::File, _) => None,
        };
        tracing::debug!("Loaded inode {} ({})", number, entry.kind);
        Ok(Arc::new(Inode::new(entry, children)))
    }

    fn catalog_children(&self, number: InodeNumber) -> Result<BTreeMap<String, ChildEntry>> {
        Ok(self
            .overlay
            .list_children(number)?
            .into_iter()
            .map(|entry| {
                (
                    entry.name,
                    ChildEntry {
                        number: entry.number,
                        kind: entry.kind,
                    },
                )
            })
            .collect())
    }

    /// Write back inodes left resident by a failed eviction, then run `hook`.
    /// No loads start once the map is draining, so the entries can be
    /// dropped without a slot.
    fn run_drained_hook(&self, hook: ShutdownHook) {
        let parked: Vec<Arc<Inode>> = self
            .state
            .lock()
            .resident
            .values()
            .filter(|resident| resident.refs == 0)
            .map(|resident| Arc::clone(&resident.inode))
            .collect();
        for inode in parked {
            match self.persist(&inode) {
                Ok(()) => {
                    self.state.lock().resident.remove(&inode.number());
                    tracing::debug!("Wrote back inode {} at shutdown", inode.number());
                }
                Err(e) => tracing::error!(
                    "Inode {} could not be written before shutdown: {}",
                    inode.number(),
                    e
                ),
            }
        }
        hook();
    }

    fn persist(&self, inode: &Inode) -> Result<()> {
        if inode.is_unlinked() {
            return self.overlay.remove_entry(inode.number());
        }
        let mut state = inode.state();
        if state.dirty {
            self.overlay.write_entry(&inode.entry_from(&state))?;
            state.dirty = false;
        }
        Ok(())
    }
}
