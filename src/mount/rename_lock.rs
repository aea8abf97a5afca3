//! Mount-wide lock over parent/child edges.
//!
//! Structural mutations hold [`RenameLock`]; multi-step path walks hold
//! [`SharedRenameLock`]. Both guards release on drop and remember which mutex
//! they came from so callees can assert they run under the right mount's lock.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;

use crate::mount::EdenMount;

#[derive(Default)]
pub struct RenameMutex {
    lock: RwLock<()>,
}

impl RenameMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no shared or exclusive holder remains.
    pub fn acquire(&self) -> RenameLock<'_> {
        RenameLock {
            _guard: self.lock.write(),
            mutex: self,
        }
    }

    /// Block only while an exclusive holder is active.
    pub fn acquire_shared(&self) -> SharedRenameLock<'_> {
        SharedRenameLock {
            _guard: self.lock.read_recursive(),
            mutex: self,
        }
    }

    pub fn try_acquire(&self) -> Option<RenameLock<'_>> {
        self.lock.try_write().map(|guard| RenameLock {
            _guard: guard,
            mutex: self,
        })
    }

    pub fn try_acquire_shared(&self) -> Option<SharedRenameLock<'_>> {
        self.lock
            .try_read_recursive()
            .map(|guard| SharedRenameLock {
                _guard: guard,
                mutex: self,
            })
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.lock.is_locked_exclusive()
    }
}

impl fmt::Debug for RenameMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenameMutex")
            .field("locked", &self.lock.is_locked())
            .finish()
    }
}

/// Exclusive hold on a mount's structure.
pub struct RenameLock<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    mutex: &'a RenameMutex,
}

impl RenameLock<'_> {
    /// Whether this guard was taken from `mutex`.
    pub fn holds(&self, mutex: &RenameMutex) -> bool {
        std::ptr::eq(self.mutex, mutex)
    }

    pub fn is_held(&self, mount: &EdenMount) -> bool {
        self.holds(mount.rename_mutex())
    }
}

/// Shared hold on a mount's structure.
pub struct SharedRenameLock<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    mutex: &'a RenameMutex,
}

impl SharedRenameLock<'_> {
    pub fn holds(&self, mutex: &RenameMutex) -> bool {
        std::ptr::eq(self.mutex, mutex)
    }

    pub fn is_held(&self, mount: &EdenMount) -> bool {
        self.holds(mount.rename_mutex())
    }
}
