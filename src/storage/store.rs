//! Content-addressed artifact store
//!
//! Keys are scheduled once and fetched at most once by a background loop with
//! bounded parallelism. Keys someone is already waiting on jump ahead of keys
//! that were merely scheduled. Fetched bytes land in a durable cache directory
//! (`<dir>/<key>`, written through a unique `<dir>/tmp/<key>.*.part` file and
//! a rename), so a later run finds them without touching the content source.

use anyhow::Context;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ContentSource, Locator};
use crate::config::StorageConfig;
use crate::core::utils::{content_hash, is_content_hash};

const QUEUED: u8 = 0;
const FETCHING: u8 = 1;
const DONE: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("content {0} was never scheduled")]
    NotScheduled(String),
    #[error("invalid content key: {0:?}")]
    InvalidKey(String),
    #[error("failed to fetch {key}: {reason}")]
    FetchFailed { key: String, reason: String },
    #[error("artifact store is closed")]
    Closed,
    #[error("failed to read cached content {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fetch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Content source calls
    pub fetches: u64,
    pub failures: u64,
    /// Keys served from the cache directory without fetching
    pub disk_hits: u64,
}

#[derive(Debug, Clone)]
enum FetchState {
    Pending,
    Ready,
    Failed(String),
}

struct Slot {
    locator: Locator,
    phase: AtomicU8,
    state: watch::Sender<FetchState>,
}

#[derive(Default)]
struct Queues {
    awaited: VecDeque<String>,
    scheduled: VecDeque<String>,
}

impl Queues {
    fn pop(&mut self) -> Option<String> {
        self.awaited
            .pop_front()
            .or_else(|| self.scheduled.pop_front())
    }
}

struct Inner {
    dir: PathBuf,
    source: Arc<dyn ContentSource>,
    slots: DashMap<String, Arc<Slot>>,
    queues: Mutex<Queues>,
    notify: Notify,
    permits: Arc<Semaphore>,
    fetches: AtomicU64,
    failures: AtomicU64,
    disk_hits: AtomicU64,
}

/// Deduplicating, prioritizing front of a [`ContentSource`]
pub struct ArtifactStore {
    inner: Arc<Inner>,
    worker: JoinHandle<()>,
}

impl ArtifactStore {
    /// Create the store and spawn its fetch loop. Must be called inside a
    /// tokio runtime.
    pub fn new(
        dir: impl Into<PathBuf>,
        source: Arc<dyn ContentSource>,
        fetch_concurrency: usize,
    ) -> Self {
        let inner = Arc::new(Inner {
            dir: dir.into(),
            source,
            slots: DashMap::new(),
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            permits: Arc::new(Semaphore::new(fetch_concurrency.max(1))),
            fetches: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
        });
        let worker = tokio::spawn(fetch_loop(Arc::clone(&inner)));
        Self { inner, worker }
    }

    pub fn from_config(config: &StorageConfig, source: Arc<dyn ContentSource>) -> Self {
        Self::new(&config.cache_dir, source, config.fetch_concurrency)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Queue `key` for fetching from `locator`.
    ///
    /// Idempotent: the first call for a key wins and later calls return
    /// `Ok(false)` without touching the queue, whatever their locator.
    pub fn schedule(&self, key: &str, locator: Locator) -> Result<bool, StoreError> {
        if !is_valid_key(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        match self.inner.slots.entry(key.to_string()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(vacant) => {
                let (state, _) = watch::channel(FetchState::Pending);
                vacant.insert(Arc::new(Slot {
                    locator,
                    phase: AtomicU8::new(QUEUED),
                    state,
                }));
            }
        }

        self.inner.lock_queues().scheduled.push_back(key.to_string());
        self.inner.notify.notify_one();
        debug!("Scheduled {}", key);
        Ok(true)
    }

    /// Wait until `key` is fetched and return its bytes.
    ///
    /// Fails immediately with [`StoreError::NotScheduled`] for unknown keys.
    /// A fetch failure is reported to every waiter, present and future.
    pub async fn wait(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let (mut rx, queued) = match self.inner.slots.get(key) {
            Some(slot) => (
                slot.state.subscribe(),
                slot.phase.load(Ordering::Acquire) == QUEUED,
            ),
            None => return Err(StoreError::NotScheduled(key.to_string())),
        };

        if queued {
            self.inner.lock_queues().awaited.push_back(key.to_string());
            self.inner.notify.notify_one();
        }

        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                FetchState::Ready => break,
                FetchState::Failed(reason) => {
                    return Err(StoreError::FetchFailed {
                        key: key.to_string(),
                        reason,
                    })
                }
                FetchState::Pending => rx.changed().await.map_err(|_| StoreError::Closed)?,
            }
        }

        let path = self.inner.dir.join(key);
        tokio::fs::read(&path)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            fetches: self.inner.fetches.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
            disk_hits: self.inner.disk_hits.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ArtifactStore {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Keys become file names inside the cache directory
fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key != "tmp"
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl Inner {
    fn lock_queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next key whose phase we managed to move from queued to fetching
    fn pop_queued(&self) -> Option<(String, Arc<Slot>)> {
        let mut queues = self.lock_queues();
        while let Some(key) = queues.pop() {
            let Some(slot) = self.slots.get(&key).map(|s| Arc::clone(s.value())) else {
                continue;
            };
            if slot
                .phase
                .compare_exchange(QUEUED, FETCHING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some((key, slot));
            }
        }
        None
    }

    async fn next_job(&self) -> (String, Arc<Slot>) {
        loop {
            if let Some(job) = self.pop_queued() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    async fn fetch_into_cache(&self, key: &str, locator: &Locator) -> anyhow::Result<()> {
        let path = self.dir.join(key);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.disk_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Serving {} from {}", key, path.display());
            return Ok(());
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let bytes = self
            .source
            .fetch(locator)
            .await
            .with_context(|| format!("Failed to fetch {}", locator.describe()))?;

        if is_content_hash(key) {
            let actual = content_hash(&bytes);
            if actual != key {
                anyhow::bail!("Content hash mismatch: expected {}, got {}", key, actual);
            }
        }

        let tmp_dir = self.dir.join("tmp");
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .with_context(|| format!("Failed to create {}", tmp_dir.display()))?;
        // Unique per writer; removed on drop unless persisted
        let part = tempfile::Builder::new()
            .prefix(&format!("{}.", key))
            .suffix(".part")
            .tempfile_in(&tmp_dir)
            .with_context(|| format!("Failed to create a temp file in {}", tmp_dir.display()))?
            .into_temp_path();
        tokio::fs::write(&part, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", part.display()))?;
        part.persist(&path)
            .with_context(|| format!("Failed to move {} into the cache", key))?;

        info!("Fetched {} ({} bytes)", key, bytes.len());
        Ok(())
    }
}

async fn fetch_loop(inner: Arc<Inner>) {
    loop {
        let permit = match Arc::clone(&inner.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let (key, slot) = inner.next_job().await;

        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let state = match inner.fetch_into_cache(&key, &slot.locator).await {
                Ok(()) => FetchState::Ready,
                Err(e) => {
                    inner.failures.fetch_add(1, Ordering::Relaxed);
                    warn!("Fetch of {} failed: {:#}", key, e);
                    FetchState::Failed(format!("{:#}", e))
                }
            };
            slot.phase.store(DONE, Ordering::Release);
            slot.state.send_replace(state);
            drop(permit);
        });
    }
}
