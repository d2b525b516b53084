use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::entry::EntryError;
use super::paths::PathError;
use super::remote::RemoteError;
use super::store::StoreError;
use super::tracker::OperationTracker;

pub const DEFAULT_QUICK_WORKERS: usize = 5;
pub const DEFAULT_SLOW_WORKERS: usize = 2;
pub const DEFAULT_SLOW_THRESHOLD: u64 = 256 * 1024;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("entry error: {0}")]
    Entry(#[from] EntryError),
    #[error("content hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

/// What a [`ChangeEngine`] needs to know about the items it schedules.
#[async_trait]
pub trait ChangeHandler: Send + Sync + 'static {
    type Item: Send + 'static;

    fn is_file(&self, item: &Self::Item) -> bool;
    fn is_delete(&self, item: &Self::Item) -> bool;
    fn file_size(&self, item: &Self::Item) -> u64;
    /// Lower-cased remote path used for echo suppression.
    fn path_key(&self, item: &Self::Item) -> String;

    async fn process(&self, item: Self::Item) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub quick_workers: usize,
    pub slow_workers: usize,
    pub slow_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quick_workers: DEFAULT_QUICK_WORKERS,
            slow_workers: DEFAULT_SLOW_WORKERS,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    Quick,
    Slow,
    Suppressed,
}

struct Ranked<T> {
    class: u8,
    size: u64,
    seq: u64,
    item: T,
}

impl<T> Ranked<T> {
    fn key(&self) -> (u8, u64, u64) {
        (self.class, self.size, self.seq)
    }
}

impl<T> PartialEq for Ranked<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for Ranked<T> {}

impl<T> PartialOrd for Ranked<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ranked<T> {
    // BinaryHeap pops the greatest element; the smallest key must win.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

struct Lane<T> {
    name: &'static str,
    queue: Mutex<BinaryHeap<Ranked<T>>>,
    ready: Notify,
}

impl<T> Lane<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            queue: Mutex::new(BinaryHeap::new()),
            ready: Notify::new(),
        }
    }

    fn push(&self, ranked: Ranked<T>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ranked);
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<T> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .map(|ranked| ranked.item)
    }

    fn len(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct EngineInner<H: ChangeHandler> {
    name: String,
    handler: Arc<H>,
    tracker: OperationTracker,
    config: EngineConfig,
    quick: Lane<H::Item>,
    slow: Lane<H::Item>,
    seq: AtomicU64,
}

/// Two priority lanes drained by fixed worker pools. Directories and
/// deletions run before files, small files before large ones; large files
/// get their own lane so they cannot starve everything else.
pub struct ChangeEngine<H: ChangeHandler> {
    inner: Arc<EngineInner<H>>,
}

impl<H: ChangeHandler> Clone for ChangeEngine<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ChangeHandler> ChangeEngine<H> {
    pub fn new(
        name: impl Into<String>,
        handler: H,
        tracker: OperationTracker,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                name: name.into(),
                handler: Arc::new(handler),
                tracker,
                config,
                quick: Lane::new("quick"),
                slow: Lane::new("slow"),
                seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn handler(&self) -> &H {
        &self.inner.handler
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.inner.tracker
    }

    pub fn schedule(&self, item: H::Item) -> Scheduled {
        let inner = &self.inner;
        let key = inner.handler.path_key(&item);
        if inner.tracker.is_tracked(&key) {
            debug!(engine = %inner.name, path = %key, "path is tracked, change dropped");
            return Scheduled::Suppressed;
        }

        let is_file = inner.handler.is_file(&item);
        let size = if is_file {
            inner.handler.file_size(&item)
        } else {
            0
        };
        let class = match (is_file, inner.handler.is_delete(&item)) {
            (false, true) => 0,
            (false, false) => 1,
            (true, _) => 2,
        };
        let ranked = Ranked {
            class,
            size,
            seq: inner.seq.fetch_add(1, AtomicOrdering::Relaxed),
            item,
        };

        if is_file && size > inner.config.slow_threshold {
            debug!(engine = %inner.name, path = %key, size, "scheduled on slow lane");
            inner.slow.push(ranked);
            Scheduled::Slow
        } else {
            debug!(engine = %inner.name, path = %key, "scheduled on quick lane");
            inner.quick.push(ranked);
            Scheduled::Quick
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.quick.len() + self.inner.slow.len()
    }

    /// Spawns the worker pools. Workers run until their tasks are aborted.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let lanes = [
            (self.inner.config.quick_workers, false),
            (self.inner.config.slow_workers, true),
        ];
        for (count, slow) in lanes {
            for _ in 0..count.max(1) {
                let inner = Arc::clone(&self.inner);
                handles.push(tokio::spawn(async move {
                    let lane = if slow { &inner.slow } else { &inner.quick };
                    loop {
                        match lane.pop() {
                            Some(item) => run_one(&inner, lane.name, item).await,
                            None => lane.ready.notified().await,
                        }
                    }
                }));
            }
        }
        handles
    }
}

async fn run_one<H: ChangeHandler>(inner: &EngineInner<H>, lane: &str, item: H::Item) {
    let key = inner.handler.path_key(&item);
    let outcome = AssertUnwindSafe(inner.handler.process(item))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => debug!(engine = %inner.name, lane, path = %key, "processed"),
        Ok(Err(err)) => warn!(engine = %inner.name, lane, path = %key, "processing failed: {err}"),
        Err(_) => error!(engine = %inner.name, lane, path = %key, "processing panicked"),
    }
}
