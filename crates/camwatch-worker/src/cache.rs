//! Shared detector-instance cache with LRU eviction.
//!
//! Keyed by `(model_path, confidence)`. Loads happen under the cache lock so
//! two tasks asking for the same model never load it twice.

use std::collections::HashMap;
use std::sync::Arc;

use camwatch_vision::{Detector, DetectorFactory};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    model_path: String,
    /// Confidence threshold bits; thresholds are compared exactly.
    confidence: u32,
}

impl CacheKey {
    fn new(model_path: &str, confidence: f32) -> Self {
        Self {
            model_path: model_path.to_string(),
            confidence: confidence.to_bits(),
        }
    }
}

struct Entry {
    detector: Arc<dyn Detector>,
    last_used: u64,
    bytes: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    tick: u64,
}

impl CacheState {
    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.bytes).sum()
    }

    /// Evict least-recently-used entries other than `keep` until within caps.
    fn evict(&mut self, keep: &CacheKey, max_instances: usize, max_bytes: u64) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max_instances || self.total_bytes() > max_bytes {
            let victim = self
                .entries
                .iter()
                .filter(|(k, _)| *k != keep)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else {
                break;
            };
            self.entries.remove(&victim);
            metrics::record_cache_eviction(&victim.model_path);
            info!(model = %victim.model_path, "Evicted detector from cache");
            evicted += 1;
        }
        evicted
    }
}

/// Bounded cache of loaded detectors.
pub struct DetectorCache {
    factory: Arc<dyn DetectorFactory>,
    max_instances: usize,
    max_bytes: u64,
    state: Mutex<CacheState>,
}

impl DetectorCache {
    pub fn new(factory: Arc<dyn DetectorFactory>, max_instances: usize, max_bytes: u64) -> Self {
        Self {
            factory,
            max_instances: max_instances.max(1),
            max_bytes,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Return a cached detector or load, insert and return a new one.
    pub async fn get_or_load(
        &self,
        model_path: &str,
        confidence: f32,
    ) -> WorkerResult<Arc<dyn Detector>> {
        let key = CacheKey::new(model_path, confidence);
        let mut state = self.state.lock().await;
        state.tick += 1;
        let tick = state.tick;

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.last_used = tick;
            metrics::record_cache_hit(model_path);
            debug!(model = model_path, "Detector cache hit");
            return Ok(entry.detector.clone());
        }

        metrics::record_cache_miss(model_path);
        let detector = self
            .factory
            .load(model_path, confidence)
            .await
            .map_err(|e| WorkerError::detector_load(format!("{}: {}", model_path, e)))?;

        info!(model = model_path, confidence, "Loaded detector");
        state.entries.insert(
            key.clone(),
            Entry {
                bytes: detector.memory_bytes(),
                detector: detector.clone(),
                last_used: tick,
            },
        );
        state.evict(&key, self.max_instances, self.max_bytes);
        Ok(detector)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, model_path: &str, confidence: f32) -> bool {
        self.state
            .lock()
            .await
            .entries
            .contains_key(&CacheKey::new(model_path, confidence))
    }

    pub async fn clear(&self) {
        self.state.lock().await.entries.clear();
    }
}
