//! In-memory log of structural changes.
//!
//! Every applied mutation gets the next sequence number. Subscribers keep their
//! own cursor and read everything after it; a cursor older than the retention
//! horizon gets `JournalTruncated` and must resynchronize from a full tree walk.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use tokio::sync::watch;

use crate::error::{EdenError, Result};
use crate::types::ObjectId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathChange {
    Created { path: PathBuf },
    Removed { path: PathBuf },
    Renamed { from: PathBuf, to: PathBuf },
    Modified { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalDelta {
    /// Assigned by [`Journal::append`].
    pub sequence: u64,
    pub time: DateTime<Utc>,
    /// Root tree of the checkout before and after the change.
    pub from_root: Option<ObjectId>,
    pub to_root: Option<ObjectId>,
    pub changes: Vec<PathChange>,
}

impl JournalDelta {
    pub fn new(root: Option<ObjectId>, changes: Vec<PathChange>) -> Self {
        JournalDelta {
            sequence: 0,
            time: Utc::now(),
            from_root: root,
            to_root: root,
            changes,
        }
    }

    /// Every path touched by this delta.
    pub fn changed_paths(&self) -> BTreeSet<PathBuf> {
        let mut paths = BTreeSet::new();
        for change in &self.changes {
            match change {
                PathChange::Created { path }
                | PathChange::Removed { path }
                | PathChange::Modified { path } => {
                    paths.insert(path.clone());
                }
                PathChange::Renamed { from, to } => {
                    paths.insert(from.clone());
                    paths.insert(to.clone());
                }
            }
        }
        paths
    }
}

struct JournalState {
    deltas: VecDeque<JournalDelta>,
    next_sequence: u64,
}

pub struct Journal {
    state: Mutex<JournalState>,
    max_deltas: usize,
    latest: watch::Sender<u64>,
}

impl Journal {
    pub fn new(max_deltas: usize) -> Self {
        let (latest, _) = watch::channel(0);
        Journal {
            state: Mutex::new(JournalState {
                deltas: VecDeque::new(),
                next_sequence: 1,
            }),
            max_deltas: max_deltas.max(1),
            latest,
        }
    }

    /// Store `delta` under the next sequence number and return that number.
    pub fn append(&self, mut delta: JournalDelta) -> u64 {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        delta.sequence = sequence;
        state.deltas.push_back(delta);
        while state.deltas.len() > self.max_deltas {
            state.deltas.pop_front();
        }
        // Published under the lock so watchers see sequences in order.
        self.latest.send_replace(sequence);
        sequence
    }

    /// All deltas with a sequence number greater than `cursor`, oldest first.
    pub fn read_since(&self, cursor: u64) -> Result<Vec<JournalDelta>> {
        let state = self.state.lock();
        if let Some(front) = state.deltas.front() {
            if cursor.saturating_add(1) < front.sequence {
                return Err(EdenError::JournalTruncated {
                    cursor,
                    oldest: front.sequence,
                });
            }
        }
        let skip = state.deltas.front().map_or(0, |front| {
            cursor.saturating_add(1).saturating_sub(front.sequence) as usize
        });
        Ok(state.deltas.iter().skip(skip).cloned().collect())
    }

    /// Sequence of the newest delta, 0 before the first append.
    pub fn latest_sequence(&self) -> u64 {
        self.state.lock().next_sequence - 1
    }

    pub fn oldest_retained(&self) -> Option<u64> {
        self.state.lock().deltas.front().map(|d| d.sequence)
    }

    pub fn len(&self) -> usize {
        self.state.lock().deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch the latest sequence number.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.latest.subscribe()
    }
}
