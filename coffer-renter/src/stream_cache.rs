use std::{
    future::Future,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::warn;

use crate::{types::FileId, Result};

pub const DEFAULT_STREAM_CACHE_SIZE: usize = 2;

type ChunkKey = (FileId, usize);
type Slot = Arc<OnceCell<Arc<Vec<u8>>>>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub fetches: u64,
}

/// Decoded chunks kept for repeated range reads, least recently used first
/// out.
///
/// Concurrent requests for a chunk that is not cached share one fetch. A
/// failed fetch is not cached.
pub struct StreamCache {
    chunks: Mutex<LruCache<ChunkKey, Slot>>,
    hits: AtomicU64,
    fetches: AtomicU64,
}

impl Default for StreamCache {
    fn default() -> Self {
        StreamCache::new(DEFAULT_STREAM_CACHE_SIZE)
    }
}

impl StreamCache {
    /// A cache of `capacity` chunks; zero is taken as one.
    pub fn new(capacity: usize) -> StreamCache {
        StreamCache {
            chunks: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            hits: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.chunks.lock().cap().get()
    }

    /// Resize the cache. A capacity of zero is ignored and the current size
    /// kept; returns whether the size changed.
    pub fn set_capacity(&self, capacity: usize) -> bool {
        match NonZeroUsize::new(capacity) {
            Some(cap) => {
                self.chunks.lock().resize(cap);
                true
            }
            None => {
                warn!("ignoring stream cache size of 0");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::SeqCst),
            fetches: self.fetches.load(Ordering::SeqCst),
        }
    }

    /// Return the cached chunk, or run `fetch` to produce it.
    pub async fn get_or_fetch<F, Fut>(&self, key: ChunkKey, fetch: F) -> Result<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let slot = {
            let mut chunks = self.chunks.lock();
            match chunks.get(&key) {
                Some(slot) => slot.clone(),
                None => {
                    let slot: Slot = Arc::new(OnceCell::new());
                    chunks.put(key, slot.clone());
                    slot
                }
            }
        };
        if let Some(chunk) = slot.get() {
            self.hits.fetch_add(1, Ordering::SeqCst);
            return Ok(chunk.clone());
        }
        let res = slot
            .get_or_try_init(|| async {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                fetch().await.map(Arc::new)
            })
            .await;
        match res {
            Ok(chunk) => Ok(chunk.clone()),
            Err(e) => {
                let mut chunks = self.chunks.lock();
                if let Some(current) = chunks.peek(&key) {
                    if Arc::ptr_eq(current, &slot) && current.get().is_none() {
                        chunks.pop(&key);
                    }
                }
                Err(e)
            }
        }
    }

    /// Drop every cached chunk of a file.
    pub fn invalidate(&self, file: &FileId) {
        let mut chunks = self.chunks.lock();
        let keys: Vec<ChunkKey> = chunks
            .iter()
            .filter(|(k, _)| k.0 == *file)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            chunks.pop(&key);
        }
    }
}
