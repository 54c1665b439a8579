// Dataset Graph Cache
//
// Keeps built graphs keyed by schema generation so concurrent requests against
// the same schema set share one immutable graph. Entries are evicted least
// recently used first, and dropped wholesale when the schema changes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use super::graph::DatasetGraph;
use crate::error::EngineError;
use crate::models::Dataset;

/// Caller-supplied identifier for one version of the dataset set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaGeneration(pub String);

impl SchemaGeneration {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for SchemaGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl GraphCacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CachedGraph {
    graph: Arc<DatasetGraph>,
    /// Logical access clock value of the last read or write
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<SchemaGeneration, CachedGraph>,
    clock: u64,
    stats: GraphCacheStats,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(generation, _)| generation.clone());
        if let Some(generation) = oldest {
            self.entries.remove(&generation);
            self.stats.evictions += 1;
            tracing::debug!("Evicted dataset graph for generation {}", generation);
        }
    }
}

/// Explicit, passed-in cache of built dataset graphs
pub struct GraphCache {
    state: Mutex<CacheState>,
    max_entries: usize,
}

impl GraphCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, generation: &SchemaGeneration) -> Option<Arc<DatasetGraph>> {
        let mut state = self.lock();
        let now = state.tick();
        match state.entries.get_mut(generation) {
            Some(entry) => {
                entry.last_used = now;
                let graph = Arc::clone(&entry.graph);
                state.stats.hits += 1;
                tracing::debug!("Graph cache hit for generation {}", generation);
                Some(graph)
            }
            None => {
                state.stats.misses += 1;
                tracing::debug!("Graph cache miss for generation {}", generation);
                None
            }
        }
    }

    pub fn put(&self, generation: SchemaGeneration, graph: Arc<DatasetGraph>) {
        let mut state = self.lock();
        if state.entries.len() >= self.max_entries && !state.entries.contains_key(&generation) {
            state.evict_lru();
        }
        let now = state.tick();
        state.entries.insert(generation, CachedGraph { graph, last_used: now });
    }

    /// Return the cached graph for `generation`, building it on a miss
    pub fn get_or_build(
        &self,
        generation: &SchemaGeneration,
        datasets: &[Dataset],
    ) -> Result<Arc<DatasetGraph>, EngineError> {
        if let Some(graph) = self.get(generation) {
            return Ok(graph);
        }
        // Built outside the lock; a racing builder just overwrites with an equal graph
        let graph = Arc::new(DatasetGraph::build(datasets)?);
        self.put(generation.clone(), Arc::clone(&graph));
        Ok(graph)
    }

    /// Drop one generation
    pub fn invalidate(&self, generation: &SchemaGeneration) -> bool {
        let mut state = self.lock();
        let removed = state.entries.remove(generation).is_some();
        if removed {
            state.stats.invalidations += 1;
            tracing::info!("Invalidated dataset graph for generation {}", generation);
        }
        removed
    }

    /// Schema-change hook: every cached graph is stale
    pub fn on_schema_change(&self) {
        let mut state = self.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.stats.invalidations += count as u64;
        tracing::info!("Schema changed; cleared {} cached dataset graphs", count);
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn get_stats(&self) -> GraphCacheStats {
        self.lock().stats.clone()
    }
}

impl Default for GraphCache {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::graph::builder::tests::crm_and_billing;

    #[test]
    fn test_get_or_build_shares_graph() {
        let cache = GraphCache::new(4);
        let generation = SchemaGeneration::new("v1");
        let first = cache.get_or_build(&generation, &crm_and_billing()).unwrap();
        let second = cache.get_or_build(&generation, &crm_and_billing()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.get_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert!(stats.hit_ratio() > 0.4);
    }

    #[test]
    fn test_build_error_not_cached() {
        let cache = GraphCache::new(4);
        let mut datasets = crm_and_billing();
        datasets[0].name = "bad name".to_string();
        assert!(cache.get_or_build(&SchemaGeneration::new("v1"), &datasets).is_err());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = GraphCache::new(2);
        let graph = Arc::new(DatasetGraph::build(&crm_and_billing()).unwrap());
        cache.put(SchemaGeneration::new("v1"), Arc::clone(&graph));
        cache.put(SchemaGeneration::new("v2"), Arc::clone(&graph));

        // Touch v1 so v2 becomes the oldest
        assert!(cache.get(&SchemaGeneration::new("v1")).is_some());
        cache.put(SchemaGeneration::new("v3"), graph);

        assert_eq!(cache.size(), 2);
        assert!(cache.get(&SchemaGeneration::new("v2")).is_none());
        assert!(cache.get(&SchemaGeneration::new("v1")).is_some());
        assert_eq!(cache.get_stats().evictions, 1);
    }

    #[test]
    fn test_invalidation() {
        let cache = GraphCache::default();
        let datasets = crm_and_billing();
        cache.get_or_build(&SchemaGeneration::new("v1"), &datasets).unwrap();
        cache.get_or_build(&SchemaGeneration::new("v2"), &datasets).unwrap();

        assert!(cache.invalidate(&SchemaGeneration::new("v1")));
        assert!(!cache.invalidate(&SchemaGeneration::new("v1")));
        assert_eq!(cache.size(), 1);

        cache.on_schema_change();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.get_stats().invalidations, 2);
    }
}
