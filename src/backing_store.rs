//! The durable store the cache flushes batches into. Deliberately a
//! synchronous trait: the local cache's core runs inside `spawn_blocking`,
//! so a blocking call here never stalls the async runtime, and it avoids
//! holding a `parking_lot::Mutex` guard across an `.await`.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;

pub trait BackingStore: Send + Sync {
    /// Pushes an entire flushed batch. Implementations should be atomic with
    /// respect to the whole batch where feasible, but the cache tolerates a
    /// partial write followed by a retry (see `LocalCache::flush_worker`).
    fn push(&self, batch: HashMap<String, Vec<u8>>) -> Result<()>;

    /// Looks up a single key on a cache miss.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Reference implementation used by tests and the demo binary: an in-process
/// map guarded by a `parking_lot::Mutex`.
#[derive(Default)]
pub struct InMemoryBackingStore {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl BackingStore for InMemoryBackingStore {
    fn push(&self, batch: HashMap<String, Vec<u8>>) -> Result<()> {
        self.data.lock().extend(batch);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().get(key).cloned())
    }
}
