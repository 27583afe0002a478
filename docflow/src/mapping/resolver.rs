//! Cache-first mapping resolution with single-flight derivation.

use super::{Fingerprint, MappingCache, MappingCacheEntry, MappingGenerator, MappingRequest};
use crate::cancellation::CancellationToken;
use crate::errors::MappingError;
use crate::events::{names, EventSink};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where a resolved mapping came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingOrigin {
    /// Found in the cache.
    Cached,
    /// Generated by this call.
    Derived,
}

/// Counters for cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Calls to the generator.
    pub derivations: u64,
    /// Cache faults degraded to a miss.
    pub degraded: u64,
}

/// Resolves mappings through a cache, deriving at most once per
/// fingerprint at a time.
///
/// Concurrent requests for the same fingerprint queue behind one
/// derivation and then read its stored result. Cache faults are logged
/// and treated as a miss.
#[derive(Clone)]
pub struct MappingResolver {
    cache: Arc<dyn MappingCache>,
    generator: Arc<dyn MappingGenerator>,
    inflight: Arc<DashMap<Fingerprint, Arc<Mutex<()>>>>,
    timeout: Duration,
    hits: Arc<AtomicU64>,
    derivations: Arc<AtomicU64>,
    degraded: Arc<AtomicU64>,
}

impl std::fmt::Debug for MappingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingResolver")
            .field("cache", &self.cache)
            .field("timeout", &self.timeout)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl MappingResolver {
    /// Creates a resolver. `timeout` bounds each derivation.
    #[must_use]
    pub fn new(cache: Arc<dyn MappingCache>, generator: Arc<dyn MappingGenerator>, timeout: Duration) -> Self {
        Self {
            cache,
            generator,
            inflight: Arc::new(DashMap::new()),
            timeout,
            hits: Arc::new(AtomicU64::new(0)),
            derivations: Arc::new(AtomicU64::new(0)),
            degraded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the counters.
    #[must_use]
    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            hits: self.hits.load(Ordering::Relaxed),
            derivations: self.derivations.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }

    async fn lookup(&self, fingerprint: &Fingerprint, events: &dyn EventSink) -> Option<String> {
        match self.cache.lookup(fingerprint).await {
            Ok(entry) => entry.map(|e| e.mapping),
            Err(err) => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
                warn!(fingerprint = %fingerprint, error = %err, "Mapping cache lookup failed, recomputing");
                events.try_emit(
                    names::MAPPING_CACHE_DEGRADED,
                    Some(serde_json::json!({"fingerprint": fingerprint, "error": err.to_string()})),
                );
                None
            }
        }
    }

    /// Resolves the mapping for `request` and runs `apply` on it.
    ///
    /// A derived mapping is stored only when `apply` succeeds. Returns
    /// `Ok(None)` when `token` is cancelled first; a derivation that
    /// finishes after cancellation is discarded.
    pub async fn resolve<T, F>(
        &self,
        request: &MappingRequest,
        token: &CancellationToken,
        events: &dyn EventSink,
        apply: F,
    ) -> Result<Option<(T, MappingOrigin)>, MappingError>
    where
        T: Send,
        F: FnOnce(&str) -> Result<T, MappingError> + Send,
    {
        let fingerprint = &request.fingerprint;

        if let Some(mapping) = self.lookup(fingerprint, events).await {
            return self.hit(fingerprint, &mapping, events, apply).map(Some);
        }

        let slot = self
            .inflight
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = tokio::select! {
            biased;
            () = token.cancelled() => Ok(None),
            guard = slot.lock() => {
                let outcome = self.derive_locked(request, token, events, apply).await;
                drop(guard);
                outcome
            }
        };

        drop(slot);
        self.inflight.remove_if(fingerprint, |_, m| Arc::strong_count(m) == 1);
        result
    }

    fn hit<T, F>(
        &self,
        fingerprint: &Fingerprint,
        mapping: &str,
        events: &dyn EventSink,
        apply: F,
    ) -> Result<(T, MappingOrigin), MappingError>
    where
        F: FnOnce(&str) -> Result<T, MappingError>,
    {
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %fingerprint, "Mapping cache hit");
        events.try_emit(names::MAPPING_CACHE_HIT, Some(serde_json::json!({"fingerprint": fingerprint})));
        apply(mapping).map(|value| (value, MappingOrigin::Cached))
    }

    async fn derive_locked<T, F>(
        &self,
        request: &MappingRequest,
        token: &CancellationToken,
        events: &dyn EventSink,
        apply: F,
    ) -> Result<Option<(T, MappingOrigin)>, MappingError>
    where
        T: Send,
        F: FnOnce(&str) -> Result<T, MappingError> + Send,
    {
        let fingerprint = &request.fingerprint;

        // Another holder of the slot may have stored it meanwhile.
        if let Some(mapping) = self.lookup(fingerprint, events).await {
            return self.hit(fingerprint, &mapping, events, apply).map(Some);
        }

        self.derivations.fetch_add(1, Ordering::Relaxed);
        let generated = tokio::select! {
            biased;
            () = token.cancelled() => None,
            generated = tokio::time::timeout(self.timeout, self.generator.generate(request)) => Some(generated),
        };
        let Some(generated) = generated else {
            debug!(fingerprint = %fingerprint, "Derivation abandoned after cancellation");
            return Ok(None);
        };
        if token.is_cancelled() {
            debug!(fingerprint = %fingerprint, "Discarding derivation that finished after cancellation");
            return Ok(None);
        }
        let mapping = generated.map_err(|_| {
            MappingError::Generation(format!("timed out after {:.1}s", self.timeout.as_secs_f64()))
        })??;

        let value = apply(&mapping)?;

        if let Err(err) = self
            .cache
            .store(MappingCacheEntry::new(fingerprint.clone(), mapping))
            .await
        {
            self.degraded.fetch_add(1, Ordering::Relaxed);
            warn!(fingerprint = %fingerprint, error = %err, "Mapping cache store failed");
        } else {
            info!(fingerprint = %fingerprint, "Derived and cached mapping");
        }
        events.try_emit(names::MAPPING_DERIVED, Some(serde_json::json!({"fingerprint": fingerprint})));
        Ok(Some((value, MappingOrigin::Derived)))
    }
}
