//! FIFO-bounded cache of decoded chunks, shared between search paths.

use crate::types::UncompressedChunk;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Cache key of one decoded chunk. `open_count` is the page reuse
/// generation: recycling a volume invalidates its old chunks without an
/// explicit purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub page_id: u32,
    pub open_count: u32,
    pub begin_offset: u32,
}

#[derive(Debug)]
struct CacheInner {
    map: HashMap<ChunkKey, Arc<UncompressedChunk>>,
    fifo: VecDeque<(ChunkKey, usize)>,
    total_size: usize,
}

/// Bounded mapping from chunk keys to decoded, read-only chunks.
///
/// Eviction is FIFO on insert. An entry present in the FIFO but missing
/// from the map (or vice versa) is tolerated: its recorded size is
/// reclaimed and the scan moves on.
#[derive(Debug)]
pub struct ChunkCache {
    inner: Mutex<CacheInner>,
    size_limit: usize,
}

impl ChunkCache {
    pub fn new(size_limit: usize) -> Self {
        ChunkCache {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                fifo: VecDeque::new(),
                total_size: 0,
            }),
            size_limit,
        }
    }

    pub fn contains(&self, key: ChunkKey) -> bool {
        let inner = self.inner.lock().expect("chunk cache lock");
        inner.map.contains_key(&key)
    }

    pub fn get(&self, key: ChunkKey) -> Option<Arc<UncompressedChunk>> {
        let inner = self.inner.lock().expect("chunk cache lock");
        inner.map.get(&key).cloned()
    }

    pub fn put(&self, key: ChunkKey, chunk: Arc<UncompressedChunk>) {
        let size = chunk.byte_size();
        let mut inner = self.inner.lock().expect("chunk cache lock");
        while inner.total_size + size > self.size_limit {
            let (evicted_key, evicted_size) = match inner.fifo.pop_back() {
                Some(entry) => entry,
                None => break,
            };
            inner.map.remove(&evicted_key);
            inner.total_size = inner.total_size.saturating_sub(evicted_size);
        }
        inner.fifo.push_front((key, size));
        inner.map.insert(key, chunk);
        inner.total_size += size;
    }

    /// Bytes currently held.
    pub fn total_size(&self) -> usize {
        self.inner.lock().expect("chunk cache lock").total_size
    }
}
