//! Write-buffered catalog.
//!
//! Mutations are queued and applied to the wrapped catalog by one dedicated
//! flush thread. Reads consult the latest pending mutation for an inode before
//! falling through, so callers always observe their own writes.

use dashmap::DashMap;
use fxhash::FxHashSet;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{EdenError, Result};
use crate::overlay::catalog::{CatalogOp, InodeCatalog, ScannedRecord};
use crate::types::{InodeNumber, OverlayEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSettings {
    /// Queued operations at which enqueuing callers start to block.
    pub depth: usize,
    /// Operations applied per transaction.
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BufferSettings {
    fn default() -> Self {
        BufferSettings {
            depth: 1024,
            batch_size: 64,
            max_retries: 3,
            retry_delay: Duration::from_millis(50),
        }
    }
}

struct Queued {
    seq: u64,
    op: CatalogOp,
}

#[derive(Default)]
struct QueueState {
    ops: VecDeque<Queued>,
    in_flight: usize,
    next_seq: u64,
    closing: bool,
    /// Set once the flush thread has left its loop and will apply nothing more.
    worker_done: bool,
}

/// Latest queued state of one row. `entry == None` means a pending removal.
#[derive(Clone)]
struct PendingOp {
    seq: u64,
    entry: Option<OverlayEntry>,
}

struct Shared {
    inner: Arc<dyn InodeCatalog>,
    settings: BufferSettings,
    queue: Mutex<QueueState>,
    /// Signalled when queue space frees up.
    space: Condvar,
    /// Signalled when work arrives or the catalog starts closing.
    work: Condvar,
    /// Signalled when the queue is empty and nothing is in flight.
    idle: Condvar,
    pending: DashMap<InodeNumber, PendingOp>,
    failed: AtomicBool,
}

pub struct BufferedCatalog {
    shared: Arc<Shared>,
    next_number: Mutex<InodeNumber>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedCatalog {
    pub fn new(inner: Arc<dyn InodeCatalog>, settings: BufferSettings) -> Result<Self> {
        let settings = BufferSettings {
            depth: settings.depth.max(1),
            batch_size: settings.batch_size.max(1),
            ..settings
        };
        let next_number = inner.high_water_mark()?;
        let shared = Arc::new(Shared {
            inner,
            settings,
            queue: Mutex::new(QueueState::default()),
            space: Condvar::new(),
            work: Condvar::new(),
            idle: Condvar::new(),
            pending: DashMap::new(),
            failed: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("overlay-flush".to_string())
            .spawn(move || flush_worker(worker_shared))
            .map_err(|e| EdenError::Io(format!("Failed to spawn overlay flush thread: {}", e)))?;

        tracing::debug!(
            "Buffered catalog started (depth {}, batch {})",
            settings.depth,
            settings.batch_size
        );

        Ok(BufferedCatalog {
            shared,
            next_number: Mutex::new(next_number),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Number of operations waiting for the flush thread.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().ops.len()
    }

    fn enqueue(&self, op: CatalogOp) -> Result<()> {
        let shared = &self.shared;
        let mut queue = shared.queue.lock();
        loop {
            if queue.closing {
                return Err(EdenError::CatalogClosed);
            }
            if queue.ops.len() < shared.settings.depth {
                break;
            }
            shared.space.wait(&mut queue);
        }

        queue.next_seq += 1;
        let seq = queue.next_seq;
        match &op {
            CatalogOp::Write(entry) => {
                shared.pending.insert(
                    entry.number,
                    PendingOp {
                        seq,
                        entry: Some(entry.clone()),
                    },
                );
            }
            CatalogOp::Remove(number) => {
                shared.pending.insert(*number, PendingOp { seq, entry: None });
            }
            CatalogOp::Allocated(_) => {}
        }
        queue.ops.push_back(Queued { seq, op });
        shared.work.notify_one();
        Ok(())
    }

    fn stop_worker(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.closing = true;
        }
        self.shared.work.notify_all();
        self.shared.space.notify_all();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("Overlay flush thread panicked");
                self.shared.failed.store(true, Ordering::SeqCst);
            }
            self.shared.queue.lock().worker_done = true;
            self.shared.idle.notify_all();
        }
    }
}

fn flush_worker(shared: Arc<Shared>) {
    loop {
        let batch: Vec<Queued> = {
            let mut queue = shared.queue.lock();
            while queue.ops.is_empty() && !queue.closing {
                shared.work.wait(&mut queue);
            }
            if queue.ops.is_empty() {
                queue.worker_done = true;
                break;
            }
            let take = queue.ops.len().min(shared.settings.batch_size);
            let batch: Vec<Queued> = queue.ops.drain(..take).collect();
            queue.in_flight = batch.len();
            shared.space.notify_all();
            batch
        };

        let ops: Vec<CatalogOp> = batch.iter().map(|q| q.op.clone()).collect();
        apply_with_retry(&shared, &ops);

        for queued in &batch {
            if let Some(number) = queued.op.target() {
                shared
                    .pending
                    .remove_if(&number, |_, pending| pending.seq == queued.seq);
            }
        }

        let mut queue = shared.queue.lock();
        queue.in_flight = 0;
        if queue.ops.is_empty() {
            shared.idle.notify_all();
        }
    }

    shared.idle.notify_all();
    tracing::debug!("Overlay flush thread exiting");
}

fn apply_with_retry(shared: &Shared, ops: &[CatalogOp]) {
    let settings = &shared.settings;
    let mut attempt = 0;
    loop {
        match shared.inner.apply_batch(ops) {
            Ok(()) => return,
            Err(e) if attempt < settings.max_retries => {
                tracing::warn!(
                    "Overlay flush of {} operation(s) failed (attempt {}): {}",
                    ops.len(),
                    attempt + 1,
                    e
                );
                std::thread::sleep(settings.retry_delay * 2u32.saturating_pow(attempt));
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    "Dropping {} overlay operation(s) after {} attempts: {}",
                    ops.len(),
                    attempt + 1,
                    e
                );
                shared.failed.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

impl InodeCatalog for BufferedCatalog {
    fn allocate_next(&self) -> Result<InodeNumber> {
        let mut next = self.next_number.lock();
        let number = InodeNumber::new(next.get() + 1);
        self.enqueue(CatalogOp::Allocated(number))?;
        *next = number;
        Ok(number)
    }

    fn write_entry(&self, entry: &OverlayEntry) -> Result<()> {
        self.enqueue(CatalogOp::Write(entry.clone()))
    }

    fn read_entry(&self, number: InodeNumber) -> Result<Option<OverlayEntry>> {
        if let Some(pending) = self.shared.pending.get(&number) {
            return Ok(pending.entry.clone());
        }
        self.shared.inner.read_entry(number)
    }

    fn remove_entry(&self, number: InodeNumber) -> Result<()> {
        self.enqueue(CatalogOp::Remove(number))
    }

    fn list_children(&self, parent: InodeNumber) -> Result<Vec<OverlayEntry>> {
        // Snapshot pending state before reading the inner catalog: anything
        // flushed in between is then visible in one of the two views.
        let pending: Vec<(InodeNumber, Option<OverlayEntry>)> = self
            .shared
            .pending
            .iter()
            .map(|item| (*item.key(), item.value().entry.clone()))
            .collect();
        let overridden: FxHashSet<InodeNumber> = pending.iter().map(|(n, _)| *n).collect();

        let mut children: Vec<OverlayEntry> = self
            .shared
            .inner
            .list_children(parent)?
            .into_iter()
            .filter(|entry| !overridden.contains(&entry.number))
            .collect();
        children.extend(
            pending
                .into_iter()
                .filter_map(|(_, entry)| entry)
                .filter(|entry| entry.parent == Some(parent)),
        );
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn high_water_mark(&self) -> Result<InodeNumber> {
        Ok(*self.next_number.lock())
    }

    fn record_allocation(&self, number: InodeNumber) -> Result<()> {
        let mut next = self.next_number.lock();
        if number > *next {
            self.enqueue(CatalogOp::Allocated(number))?;
            *next = number;
        }
        Ok(())
    }

    fn scan_records(&self) -> Result<Vec<ScannedRecord>> {
        self.flush()?;
        self.shared.inner.scan_records()
    }

    fn apply_batch(&self, ops: &[CatalogOp]) -> Result<()> {
        for op in ops {
            match op {
                CatalogOp::Allocated(number) => self.record_allocation(*number)?,
                other => self.enqueue(other.clone())?,
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut queue = shared.queue.lock();
            while !(queue.ops.is_empty() && queue.in_flight == 0) {
                if queue.worker_done {
                    break;
                }
                shared.idle.wait(&mut queue);
            }
        }
        if self.has_failed() {
            return Err(EdenError::Catalog(
                "one or more buffered overlay writes could not be flushed".to_string(),
            ));
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let drained = self.flush();
        self.stop_worker();
        let closed = self.shared.inner.close();
        drained.and(closed)
    }

    fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst) || self.shared.inner.has_failed()
    }
}

impl Drop for BufferedCatalog {
    fn drop(&mut self) {
        if self.worker.lock().is_some() {
            if let Err(e) = self.flush() {
                tracing::warn!("Buffered catalog dropped with unflushed writes: {}", e);
            }
            self.stop_worker();
        }
    }
}
