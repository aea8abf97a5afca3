use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;

use crate::types::{ContentRef, InodeKind, InodeNumber, ObjectId, OverlayEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEntry {
    pub number: InodeNumber,
    pub kind: InodeKind,
}

/// Child set of a tree inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeChildren {
    /// Still described only by the backing store tree with this id.
    Unloaded(ObjectId),
    /// Enumerated; the catalog holds one row per child.
    Loaded(BTreeMap<String, ChildEntry>),
}

#[derive(Debug)]
pub struct InodeState {
    pub parent: Option<InodeNumber>,
    pub name: String,
    pub content: ContentRef,
    /// Set when the in-memory state is ahead of the catalog row.
    pub dirty: bool,
    /// `None` for files.
    pub children: Option<TreeChildren>,
}

/// One resident filesystem entry. Shared between request threads through
/// `Arc`; the reference count lives in the InodeMap.
#[derive(Debug)]
pub struct Inode {
    number: InodeNumber,
    kind: InodeKind,
    state: Mutex<InodeState>,
}

impl Inode {
    pub(crate) fn new(entry: OverlayEntry, children: Option<TreeChildren>) -> Self {
        Inode {
            number: entry.number,
            kind: entry.kind,
            state: Mutex::new(InodeState {
                parent: entry.parent,
                name: entry.name,
                content: entry.content,
                dirty: false,
                children,
            }),
        }
    }

    pub fn number(&self) -> InodeNumber {
        self.number
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    pub fn is_tree(&self) -> bool {
        self.kind == InodeKind::Tree
    }

    pub fn parent(&self) -> Option<InodeNumber> {
        self.state.lock().parent
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn content(&self) -> ContentRef {
        self.state.lock().content
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Removed from its parent but still referenced.
    pub fn is_unlinked(&self) -> bool {
        !self.number.is_root() && self.state.lock().parent.is_none()
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.state.lock().children, Some(TreeChildren::Loaded(_)))
    }

    /// Look up a child of an enumerated tree.
    pub fn child(&self, name: &str) -> Option<ChildEntry> {
        match &self.state.lock().children {
            Some(TreeChildren::Loaded(children)) => children.get(name).copied(),
            _ => None,
        }
    }

    /// Children of an enumerated tree, ordered by name.
    pub fn children(&self) -> Option<Vec<(String, ChildEntry)>> {
        match &self.state.lock().children {
            Some(TreeChildren::Loaded(children)) => Some(
                children
                    .iter()
                    .map(|(name, child)| (name.clone(), *child))
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn to_entry(&self) -> OverlayEntry {
        self.entry_from(&self.state.lock())
    }

    pub(crate) fn entry_from(&self, state: &InodeState) -> OverlayEntry {
        OverlayEntry {
            number: self.number,
            parent: state.parent,
            name: state.name.clone(),
            kind: self.kind,
            content: state.content,
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }

    pub(crate) fn set_location(&self, parent: Option<InodeNumber>, name: &str) {
        let mut state = self.state.lock();
        state.parent = parent;
        state.name = name.to_string();
    }

    pub(crate) fn insert_child(&self, name: &str, child: ChildEntry) {
        if let Some(TreeChildren::Loaded(children)) = &mut self.state.lock().children {
            children.insert(name.to_string(), child);
        }
    }

    pub(crate) fn remove_child(&self, name: &str) -> Option<ChildEntry> {
        match &mut self.state.lock().children {
            Some(TreeChildren::Loaded(children)) => children.remove(name),
            _ => None,
        }
    }

    /// Switch to overlay-local content. The catalog row is rewritten when the
    /// last reference is released.
    pub(crate) fn materialize_content(&self) {
        let mut state = self.state.lock();
        state.content = ContentRef::Local;
        state.dirty = true;
    }
}
