//! One ingestion cycle for one cluster: fetch, build, normalize, emit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use kgraph_core::{
    ClusterRef, CycleError, EntityDelta, ErrorScope, IngestError, IngestionCycleResult, KindSelector, RawResource,
    ValidationError,
};
use kgraph_entity::Normalizer;
use kgraph_graph::ResourceForest;
use kgraph_kubehub::Fetcher;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::delta::{CachedEntity, EntityCache};
use crate::index::{ClusterView, CycleState, DeltaSummary, GraphIndex};
use crate::sink::CatalogSink;

/// What happened in one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub result: IngestionCycleResult,
    /// Delta computed on Emitting; empty when nothing changed or the cycle failed.
    pub delta: EntityDelta,
    /// The sink acknowledged `delta` (trivially true for an empty delta).
    pub delivered: bool,
    /// No usable output: every kind failed or the sink rejected the delta.
    pub failed: bool,
    pub consecutive_failures: u32,
}

pub struct Pipeline {
    fetcher: Fetcher,
    selectors: Vec<KindSelector>,
    normalizer: Normalizer,
    sink: Arc<dyn CatalogSink>,
    index: Arc<GraphIndex>,
}

fn resource_label(err: &ValidationError) -> String {
    match err {
        ValidationError::MissingNamespace { kind, name } => format!("{}/{}", kind, name),
        ValidationError::MissingName { kind, uid } => format!("{} uid={}", kind, uid),
        ValidationError::MissingUid { kind, name } => format!("{}/{}", kind, name),
    }
}

impl Pipeline {
    pub fn new(
        fetcher: Fetcher,
        selectors: Vec<KindSelector>,
        normalizer: Normalizer,
        sink: Arc<dyn CatalogSink>,
        index: Arc<GraphIndex>,
    ) -> Self {
        Self { fetcher, selectors, normalizer, sink, index }
    }

    pub fn selectors(&self) -> &[KindSelector] { &self.selectors }

    pub fn index(&self) -> &Arc<GraphIndex> { &self.index }

    /// Run one cycle. `cache` is the cluster's previous-cycle state and only
    /// advances once the sink has accepted the delta.
    ///
    /// Returns `None` when cancelled before Emitting; nothing is sent then.
    pub async fn run_cycle(
        &self,
        cluster: &ClusterRef,
        cache: &mut EntityCache,
        cancel: &CancellationToken,
    ) -> Option<CycleReport> {
        let t0 = Instant::now();
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let name = cluster.name.as_str();
        self.index.update_status(name, |s| {
            s.state = CycleState::Fetching;
            s.last_started_at = Some(started_at);
        });
        debug!(cluster = %name, cycle = %cycle_id, kinds = self.selectors.len(), "cycle: fetching");

        let fetches = join_all(self.selectors.iter().map(|s| self.fetcher.fetch(cluster, s)));
        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.index.set_state(name, CycleState::Idle);
                info!(cluster = %name, "cycle: cancelled while fetching");
                return None;
            }
            outcomes = fetches => outcomes,
        };

        let mut errors: Vec<CycleError> = Vec::new();
        let mut failed_selectors: BTreeSet<String> = BTreeSet::new();
        let mut resources: Vec<RawResource> = Vec::new();
        for (selector, outcome) in self.selectors.iter().zip(outcomes) {
            match outcome {
                Ok(out) => {
                    for invalid in out.invalid {
                        let scope = ErrorScope::Resource { cluster: name.to_string(), resource: resource_label(&invalid) };
                        errors.push(CycleError::new(scope, &IngestError::from(invalid)));
                    }
                    resources.extend(out.resources);
                }
                Err(err) => {
                    let scope = ErrorScope::Kind { cluster: name.to_string(), selector: selector.key() };
                    errors.push(CycleError::new(scope, &IngestError::from(err)));
                    failed_selectors.insert(selector.key());
                }
            }
        }

        if !self.selectors.is_empty() && failed_selectors.len() == self.selectors.len() {
            warn!(cluster = %name, kinds = failed_selectors.len(), "cycle: every kind failed; keeping last good state");
            counter!("kgraph_cycles_total", 1u64, "cluster" => name.to_string(), "outcome" => "failed");
            let consecutive_failures = self.index.record_failure(name, errors.clone());
            let result = IngestionCycleResult {
                cycle_id,
                cluster: cluster.clone(),
                started_at,
                finished_at: Utc::now(),
                entities: Vec::new(),
                errors,
                failed_selectors,
            };
            return Some(CycleReport { result, delta: EntityDelta::default(), delivered: false, failed: true, consecutive_failures });
        }

        self.index.set_state(name, CycleState::Building);
        let forest = kgraph_graph::build(resources);
        for cut in forest.cut_edges() {
            warn!(cluster = %name, child = %forest.node(cut.child).resource.uid, parent = %forest.node(cut.parent).resource.uid, "cycle: owner reference cycle broken");
        }
        if !forest.dangling().is_empty() {
            debug!(cluster = %name, count = forest.dangling().len(), "cycle: owner references outside the fetched set");
        }

        self.index.set_state(name, CycleState::Normalizing);
        let normalized = self.normalizer.normalize_forest(&forest);
        for (node, invalid) in &normalized.invalid {
            let resource = forest.node(*node).resource.uid.clone();
            let scope = ErrorScope::Resource { cluster: name.to_string(), resource };
            errors.push(CycleError::new(scope, &IngestError::from(invalid.clone())));
        }

        if cancel.is_cancelled() {
            self.index.set_state(name, CycleState::Idle);
            info!(cluster = %name, "cycle: cancelled before emitting");
            return None;
        }

        self.index.set_state(name, CycleState::Emitting);
        let next: Vec<CachedEntity> = normalized
            .entities
            .iter()
            .zip(&normalized.sources)
            .map(|(e, &src)| CachedEntity::new(forest.node(src).resource.selector.clone(), e.clone()))
            .collect();
        let (delta, next_cache) = cache.diff(next, &failed_selectors);

        let mut delivered = true;
        if delta.is_empty() {
            *cache = next_cache.clone();
        } else {
            match self.sink.apply(name, &delta).await {
                Ok(()) => {
                    counter!("kgraph_entities_emitted_total", delta.len() as u64, "cluster" => name.to_string());
                    *cache = next_cache.clone();
                }
                Err(e) => {
                    delivered = false;
                    warn!(cluster = %name, error = %format!("{:#}", e), "cycle: sink rejected delta; will re-send");
                    let scope = ErrorScope::Cluster { cluster: name.to_string() };
                    errors.push(CycleError::new(scope, &IngestError::Sink(format!("{:#}", e))));
                }
            }
        }

        let finished_at = Utc::now();
        self.index.publish_view(build_view(name, cycle_id, finished_at, &forest, &normalized.sources, &next_cache));

        let failed = !delivered;
        let summary = DeltaSummary::from(&delta);
        let status = self.index.update_status(name, |s| {
            s.state = if failed { CycleState::Failed } else { CycleState::Idle };
            s.cycles += 1;
            s.last_finished_at = Some(finished_at);
            if failed {
                s.consecutive_failures = s.consecutive_failures.saturating_add(1);
            } else {
                s.consecutive_failures = 0;
                s.last_success_at = Some(finished_at);
            }
            s.error_count = errors.len();
            s.last_errors = errors.clone();
            s.entities = next_cache.len();
            s.last_delta = Some(summary);
        });

        let outcome = if failed { "failed" } else if errors.is_empty() { "ok" } else { "partial" };
        counter!("kgraph_cycles_total", 1u64, "cluster" => name.to_string(), "outcome" => outcome);
        histogram!("kgraph_cycle_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            cluster = %name,
            cycle = %cycle_id,
            entities = normalized.entities.len(),
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            errors = errors.len(),
            took_ms = %t0.elapsed().as_millis(),
            "cycle: {}", outcome
        );

        let result = IngestionCycleResult {
            cycle_id,
            cluster: cluster.clone(),
            started_at,
            finished_at,
            entities: normalized.entities,
            errors,
            failed_selectors,
        };
        Some(CycleReport { result, delta, delivered, failed, consecutive_failures: status.consecutive_failures })
    }
}

/// Graph membership uses this cycle's forest; the entity map also holds
/// entities carried forward for kinds that failed.
fn build_view(
    cluster: &str,
    cycle_id: Uuid,
    finished_at: chrono::DateTime<Utc>,
    forest: &ResourceForest,
    sources: &[usize],
    cache: &EntityCache,
) -> ClusterView {
    let entities: BTreeMap<String, _> = cache.entities().map(|e| (e.id.clone(), e.clone())).collect();
    let mut node_entity: FxHashMap<usize, String> = FxHashMap::default();
    for &src in sources {
        if let Ok(id) = kgraph_entity::entity_id(&forest.node(src).resource) {
            node_entity.insert(src, id);
        }
    }

    let mut graphs = BTreeMap::new();
    let mut graph_of = FxHashMap::default();
    for g in forest.graphs() {
        let Some(root_id) = node_entity.get(&g.root) else { continue };
        let members: Vec<String> = g.nodes.iter().filter_map(|n| node_entity.get(n).cloned()).collect();
        for m in &members {
            graph_of.insert(m.clone(), root_id.clone());
        }
        graphs.insert(root_id.clone(), members);
    }
    ClusterView { cluster: cluster.to_string(), cycle_id, finished_at, entities, graphs, graph_of }
}
