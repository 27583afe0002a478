//! Content-addressed storage of derived mappings.

use super::Fingerprint;
use crate::errors::CacheError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::num::NonZeroUsize;
use tracing::debug;

/// A derived mapping keyed by the fingerprint it was derived for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingCacheEntry {
    /// The content address.
    pub fingerprint: Fingerprint,
    /// The derived artifact: a projection query over `df`.
    pub mapping: String,
    /// When the entry was derived.
    pub created_at: DateTime<Utc>,
}

impl MappingCacheEntry {
    /// Creates an entry stamped now.
    #[must_use]
    pub fn new(fingerprint: Fingerprint, mapping: impl Into<String>) -> Self {
        Self {
            fingerprint,
            mapping: mapping.into(),
            created_at: Utc::now(),
        }
    }
}

/// Storage backend for derived mappings.
///
/// A miss is `Ok(None)`, never an error. `store` is an upsert and
/// last-write-wins under racing writers.
#[async_trait]
pub trait MappingCache: Send + Sync + Debug {
    /// Looks up the mapping derived for a fingerprint.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<MappingCacheEntry>, CacheError>;

    /// Inserts or replaces an entry.
    async fn store(&self, entry: MappingCacheEntry) -> Result<(), CacheError>;
}

#[derive(Debug)]
enum Entries {
    Unbounded(DashMap<Fingerprint, MappingCacheEntry>),
    Bounded(Mutex<LruCache<Fingerprint, MappingCacheEntry>>),
}

/// In-memory cache, optionally bounded with least-recently-used eviction.
#[derive(Debug)]
pub struct InMemoryMappingCache {
    entries: Entries,
}

impl Default for InMemoryMappingCache {
    fn default() -> Self {
        Self {
            entries: Entries::Unbounded(DashMap::new()),
        }
    }
}

impl InMemoryMappingCache {
    /// Creates an unbounded cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache holding at most `capacity` entries.
    ///
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Entries::Bounded(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.entries {
            Entries::Unbounded(map) => map.len(),
            Entries::Bounded(lru) => lru.lock().len(),
        }
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MappingCache for InMemoryMappingCache {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<MappingCacheEntry>, CacheError> {
        Ok(match &self.entries {
            Entries::Unbounded(map) => map.get(fingerprint).map(|e| e.value().clone()),
            Entries::Bounded(lru) => lru.lock().get(fingerprint).cloned(),
        })
    }

    async fn store(&self, entry: MappingCacheEntry) -> Result<(), CacheError> {
        match &self.entries {
            Entries::Unbounded(map) => {
                map.insert(entry.fingerprint.clone(), entry);
            }
            Entries::Bounded(lru) => {
                if let Some((evicted, _)) = lru.lock().push(entry.fingerprint.clone(), entry) {
                    debug!(fingerprint = %evicted, "Evicting mapping");
                }
            }
        }
        Ok(())
    }
}
