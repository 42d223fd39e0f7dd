//! memoir — long-form conversational memory engine.
//!
//! Sits between a raw LLM client and an application's chat loop: a
//! token-accounted context window, an LLM-driven distiller that turns
//! conversation segments into durable memories, a SQLite store with
//! cooperating vector and full-text indexes, a hybrid retriever, and an
//! orchestrator that wires them together on every turn.

pub mod config;
pub mod consolidate;
pub mod context;
pub mod db;
pub mod distill;
pub mod error;
pub mod llm;
pub mod orchestrate;
pub mod prompts;
pub mod retrieve;
pub mod thresholds;

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

pub use config::MemoryConfig;
pub use error::{MemoryError, Result};
pub use orchestrate::{Orchestrator, TurnOutcome};

/// Small LRU cache for query embeddings, so repeated or near-duplicate
/// queries don't hit the embedding backend twice.
#[derive(Clone)]
pub struct EmbedCache {
    inner: Arc<Mutex<EmbedCacheInner>>,
}

struct EmbedCacheInner {
    cache: LruCache<String, Vec<f32>>,
    hits: u64,
    misses: u64,
}

impl EmbedCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(128).expect("nonzero literal"));
        Self {
            inner: Arc::new(Mutex::new(EmbedCacheInner {
                cache: LruCache::new(cap),
                hits: 0,
                misses: 0,
            })),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock();
        let val = inner.cache.get(key).cloned();
        if val.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        val
    }

    pub fn insert(&self, key: String, value: Vec<f32>) {
        self.inner.lock().cache.put(key, value);
    }

    /// (entries, capacity, hits, misses)
    pub fn stats(&self) -> (usize, usize, u64, u64) {
        let inner = self.inner.lock();
        (inner.cache.len(), inner.cache.cap().get(), inner.hits, inner.misses)
    }
}
