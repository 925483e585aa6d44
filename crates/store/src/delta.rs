//! Previous-cycle cache and delta computation.

use std::collections::{BTreeMap, BTreeSet};

use kgraph_core::{EntityDelta, NormalizedEntity};
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    pub hash: u64,
    /// Selector key of the resource the entity came from.
    pub selector: String,
    pub entity: NormalizedEntity,
}

impl CachedEntity {
    pub fn new(selector: impl Into<String>, entity: NormalizedEntity) -> Self {
        Self { hash: entity.content_hash(), selector: selector.into(), entity }
    }
}

/// Entities last acknowledged by the sink for one cluster, keyed by entity id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityCache {
    entries: BTreeMap<String, CachedEntity>,
}

impl EntityCache {
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn get(&self, id: &str) -> Option<&CachedEntity> { self.entries.get(id) }
    pub fn entities(&self) -> impl Iterator<Item = &NormalizedEntity> + '_ { self.entries.values().map(|c| &c.entity) }

    /// Diff this cache against the entities of a new cycle.
    ///
    /// Entities absent from `next` are removed unless their selector is in
    /// `failed`: those are carried forward unchanged, since their absence
    /// only means the kind could not be listed this cycle. Returns the delta
    /// and the cache to keep once the sink has accepted it.
    pub fn diff(&self, next: Vec<CachedEntity>, failed: &BTreeSet<String>) -> (EntityDelta, EntityCache) {
        // Collapse duplicate ids: first position, last content.
        let mut order: Vec<String> = Vec::with_capacity(next.len());
        let mut latest: FxHashMap<String, CachedEntity> = FxHashMap::default();
        for c in next {
            let id = c.entity.id.clone();
            if latest.insert(id.clone(), c).is_some() {
                debug!(id = %id, "delta: duplicate entity id in cycle; keeping last");
            } else {
                order.push(id);
            }
        }

        let mut delta = EntityDelta::default();
        let mut cache = EntityCache::default();
        for id in order {
            let Some(c) = latest.remove(&id) else { continue };
            match self.entries.get(&id) {
                None => delta.added.push(c.entity.clone()),
                Some(prev) if prev.hash != c.hash => delta.updated.push(c.entity.clone()),
                Some(_) => {}
            }
            cache.entries.insert(id, c);
        }
        for (id, prev) in &self.entries {
            if cache.entries.contains_key(id) {
                continue;
            }
            if failed.contains(&prev.selector) {
                cache.entries.insert(id.clone(), prev.clone());
            } else {
                delta.removed.push(id.clone());
            }
        }
        (delta, cache)
    }
}

/// Delta between two plain entity sets (no carry-forward).
pub fn compute_delta(previous: &[NormalizedEntity], next: &[NormalizedEntity]) -> EntityDelta {
    let mut prev = EntityCache::default();
    for e in previous {
        prev.entries.insert(e.id.clone(), CachedEntity::new("", e.clone()));
    }
    let next = next.iter().cloned().map(|e| CachedEntity::new("", e)).collect();
    prev.diff(next, &BTreeSet::new()).0
}
