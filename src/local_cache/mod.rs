//! The per-node hot cache: a WAL-backed map of unflushed writes plus a
//! bounded LRU of clean reads, sitting in front of a pluggable backing
//! store.
//!
//! The core (`CacheInner`) is entirely synchronous and guarded by a single
//! `parking_lot::Mutex`, matching the spec's "cache mutex held across store
//! and across get" requirement. `LocalCache` is the async facade that runs
//! every call through `tokio::task::spawn_blocking` — the same bridge
//! pattern already used elsewhere in this codebase for lock-heavy
//! synchronous work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backing_store::BackingStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lru::Lru;
use crate::metrics::Metrics;
use crate::record::WalRecord;
use crate::wal::{self, TagSource, Wal, WalOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetResult {
    Found(Vec<u8>),
    NotFound,
}

struct CacheState {
    wal: Wal,
    hot_map: HashMap<String, Vec<u8>>,
    ro_cache: Lru<Vec<u8>>,
    counter: usize,
    tags: TagSource,
}

struct CacheInner {
    state: Mutex<CacheState>,
    base_path: PathBuf,
    wal_options: WalOptions,
    cache_size: usize,
    backing: Arc<dyn BackingStore>,
    signal_tx: mpsc::Sender<u64>,
    metrics: Arc<Metrics>,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl CacheInner {
    /// Appends `key`/`value`, rotating the active segment if the write
    /// pushes the record counter to `cache_size`.
    fn store(&self, key: String, value: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock();
        state.wal.write(&WalRecord {
            key: key.clone(),
            value: value.clone(),
        })?;
        state.hot_map.insert(key, value);
        state.counter += 1;

        if state.counter >= self.cache_size {
            self.rotate_locked(&mut state)?;
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<GetResult> {
        let mut state = self.state.lock();
        if let Some(v) = state.hot_map.get(key) {
            self.metrics.cache_hits.inc();
            return Ok(GetResult::Found(v.clone()));
        }
        if let Some(v) = state.ro_cache.get(key) {
            self.metrics.cache_hits.inc();
            return Ok(GetResult::Found(v.clone()));
        }
        self.metrics.cache_misses.inc();
        match self.backing.get(key) {
            Ok(Some(v)) => {
                state.ro_cache.put(key.to_string(), v.clone());
                Ok(GetResult::Found(v))
            }
            Ok(None) => Ok(GetResult::NotFound),
            Err(e) => {
                self.metrics.db_errors.inc();
                Err(e)
            }
        }
    }

    /// Forces a rotation if there is anything unflushed, regardless of
    /// whether `cache_size` has been reached. Used by the periodic ticker.
    fn tick(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.counter > 0 {
            self.rotate_locked(&mut state)?;
        }
        Ok(())
    }

    /// Seals the active segment (closes it, renames its directory with a
    /// monotone tag) and opens a fresh one in its place, then enqueues the
    /// sealed tag on the signal channel. Entered and exited with the cache
    /// lock already held; the blocking send on a full channel is exactly the
    /// intended backpressure on `store`/`tick`.
    fn rotate_locked(&self, state: &mut CacheState) -> Result<()> {
        let tag = state.tags.next(now_nanos());
        let sealed_path = sealed_path_for(&self.base_path, tag);

        state.wal.sync()?;
        std::fs::rename(&self.base_path, &sealed_path).map_err(|e| Error::io("seal wal segment", e))?;

        let fresh = Wal::open(&self.base_path, self.wal_options.clone(), self.metrics.clone())?;
        state.wal = fresh;
        state.counter = 0;

        self.signal_tx.blocking_send(tag).map_err(|_| Error::ChannelClosed)?;
        self.metrics.wal_switchovers.inc();
        debug!(tag, "sealed wal segment and rotated");
        Ok(())
    }

    /// Removes `key` from HotMap only if its current value still equals
    /// `flushed_value` — a concurrent `store` may have overwritten it with a
    /// value that lives in the (still active, not yet flushed) new segment.
    fn retire_if_unchanged(&self, key: &str, flushed_value: &[u8]) {
        let mut state = self.state.lock();
        if state.hot_map.get(key).map(|v| v.as_slice()) == Some(flushed_value) {
            state.hot_map.remove(key);
        }
    }
}

fn sealed_path_for(base: &std::path::Path, tag: u64) -> PathBuf {
    let stem = base.file_name().and_then(|s| s.to_str()).unwrap_or("wal");
    let parent = base.parent().map(PathBuf::from).unwrap_or_default();
    parent.join(format!("{stem}.{tag}"))
}

/// Async facade over `CacheInner`. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct LocalCache {
    inner: Arc<CacheInner>,
}

/// Handle to the cache's long-running background tasks, returned by `open`
/// so the caller can await a clean shutdown.
pub struct CacheTasks {
    pub flush_worker: JoinHandle<()>,
}

impl LocalCache {
    /// Opens the cache at `config.wal_path`, replays any active-segment
    /// records into HotMap, re-enqueues any sealed-but-unflushed segments
    /// discovered on disk, and spawns the flush worker.
    pub async fn open(
        config: &Config,
        backing: Arc<dyn BackingStore>,
        metrics: Arc<Metrics>,
    ) -> Result<(Self, CacheTasks)> {
        let base_path = config.wal_path.clone();
        let wal_options = WalOptions {
            segment_size: config.wal_segment_size,
            sync_mode: config.wal_sync_mode,
            file_ext: config.wal_file_ext.clone(),
        };

        let base_path_for_blocking = base_path.clone();
        let wal_options_for_blocking = wal_options.clone();
        let metrics_for_blocking = metrics.clone();
        let (wal, replayed, sealed) = tokio::task::spawn_blocking(move || -> Result<_> {
            let wal = Wal::open(&base_path_for_blocking, wal_options_for_blocking, metrics_for_blocking.clone())?;
            let replayed = wal::scan_dir(&base_path_for_blocking, wal.file_ext(), &metrics_for_blocking)?;
            let sealed = wal::find_sealed_siblings(&base_path_for_blocking)?;
            Ok((wal, replayed, sealed))
        })
        .await
        .map_err(|e| Error::Replication(format!("recovery task panicked: {e}")))??;

        let mut hot_map = HashMap::new();
        for record in replayed {
            hot_map.insert(record.key, record.value);
        }
        let counter = hot_map.len();

        let mut tags = TagSource::new();
        for (tag, _) in &sealed {
            tags.next(*tag);
        }

        let (signal_tx, signal_rx) = mpsc::channel(config.max_signal_queue.max(1));

        let inner = Arc::new(CacheInner {
            state: Mutex::new(CacheState {
                wal,
                hot_map,
                ro_cache: Lru::new(config.ro_cache_size),
                counter,
                tags,
            }),
            base_path,
            wal_options,
            cache_size: config.cache_size,
            backing,
            signal_tx: signal_tx.clone(),
            metrics: metrics.clone(),
        });

        for (tag, _) in sealed {
            // Startup re-enqueue of sealed-but-unflushed segments: without
            // this, a crash between seal and flush strands that data
            // forever.
            signal_tx
                .send(tag)
                .await
                .map_err(|_| Error::ChannelClosed)?;
        }

        let flush_worker = spawn_flush_worker(inner.clone(), signal_rx);

        Ok((Self { inner }, CacheTasks { flush_worker }))
    }

    pub async fn store(&self, key: String, value: Vec<u8>) -> Result<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.store(key, value))
            .await
            .map_err(|e| Error::Replication(format!("store task panicked: {e}")))?
    }

    pub async fn get(&self, key: &str) -> Result<GetResult> {
        let inner = self.inner.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || inner.get(&key))
            .await
            .map_err(|e| Error::Replication(format!("get task panicked: {e}")))?
    }

    pub async fn tick(&self) -> Result<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.tick())
            .await
            .map_err(|e| Error::Replication(format!("tick task panicked: {e}")))?
    }

    /// Spawns the periodic ticker task that forces rotation of any
    /// partially-filled segment so staleness is bounded.
    pub fn spawn_ticker(&self, delay: std::time::Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(delay);
            loop {
                interval.tick().await;
                if let Err(e) = cache.tick().await {
                    warn!(error = %e, "cache tick failed");
                }
            }
        })
    }
}

fn spawn_flush_worker(inner: Arc<CacheInner>, mut signal_rx: mpsc::Receiver<u64>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(tag) = signal_rx.recv().await {
            let inner = inner.clone();
            let result = tokio::task::spawn_blocking(move || flush_one(&inner, tag)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    inner.metrics.db_errors.inc();
                    error!(tag, error = %e, "flush of sealed segment failed, will retry on restart");
                }
                Err(join_err) => {
                    error!(tag, error = %join_err, "flush task panicked");
                }
            }
        }
        debug!("flush worker exiting, signal channel closed");
    })
}

fn flush_one(inner: &CacheInner, tag: u64) -> Result<()> {
    let sealed_path = sealed_path_for(&inner.base_path, tag);
    let records = wal::scan_dir(&sealed_path, &inner.wal_options.file_ext, &inner.metrics)?;

    let mut batch = HashMap::with_capacity(records.len());
    for record in &records {
        batch.insert(record.key.clone(), record.value.clone());
    }

    inner.backing.push(batch)?;

    for record in &records {
        inner.retire_if_unchanged(&record.key, &record.value);
    }

    wal::delete_dir(&sealed_path)?;
    Ok(())
}
