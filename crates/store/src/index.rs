//! Read-side index of the last completed cycle per cluster.
//!
//! Writers (one task per cluster) publish whole views through `ArcSwap`;
//! readers never block writers and always see a complete cycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use kgraph_core::{CycleError, EntityDelta, NormalizedEntity};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CycleState {
    #[default]
    Idle,
    Fetching,
    Building,
    Normalizing,
    Emitting,
    /// Recoverable; the next tick starts over.
    Failed,
}

/// Entities and graphs produced by one completed cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub cluster: String,
    pub cycle_id: Uuid,
    pub finished_at: DateTime<Utc>,
    pub entities: BTreeMap<String, NormalizedEntity>,
    /// root entity id -> member entity ids, breadth-first from the root
    pub graphs: BTreeMap<String, Vec<String>>,
    /// member entity id -> root entity id
    pub graph_of: FxHashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct DeltaSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl From<&EntityDelta> for DeltaSummary {
    fn from(d: &EntityDelta) -> Self { Self { added: d.added.len(), updated: d.updated.len(), removed: d.removed.len() } }
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub cluster: String,
    pub state: CycleState,
    pub cycles: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Errors recorded by the most recent cycle.
    pub error_count: usize,
    pub last_errors: Vec<CycleError>,
    pub entities: usize,
    pub last_delta: Option<DeltaSummary>,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocatorStatus {
    pub resolved_at: Option<DateTime<Utc>>,
    pub clusters: usize,
    /// Set while the locator is unavailable.
    pub error: Option<String>,
    /// Cluster definitions skipped on the last pass.
    pub skipped: Vec<String>,
}

pub struct GraphIndex {
    views: ArcSwap<FxHashMap<String, Arc<ClusterView>>>,
    status: ArcSwap<FxHashMap<String, ClusterStatus>>,
    locator: ArcSwap<LocatorStatus>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for GraphIndex {
    fn default() -> Self { Self::new() }
}

impl GraphIndex {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            views: ArcSwap::from_pointee(FxHashMap::default()),
            status: ArcSwap::from_pointee(FxHashMap::default()),
            locator: ArcSwap::from_pointee(LocatorStatus::default()),
            epoch_tx,
        }
    }

    /// Bumped whenever a cycle finishes or a cluster is forgotten.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    fn bump(&self) { self.epoch_tx.send_modify(|e| *e = e.saturating_add(1)); }

    pub fn view(&self, cluster: &str) -> Option<Arc<ClusterView>> { self.views.load().get(cluster).cloned() }

    pub fn views(&self) -> Vec<Arc<ClusterView>> {
        let mut out: Vec<_> = self.views.load().values().cloned().collect();
        out.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        out
    }

    /// View holding `entity_id`, looked up by the cluster prefix of the id.
    pub fn view_for_entity(&self, entity_id: &str) -> Option<Arc<ClusterView>> {
        let views = self.views.load();
        if let Some(v) = entity_id.split_once('/').and_then(|(c, _)| views.get(c)) {
            if v.entities.contains_key(entity_id) {
                return Some(Arc::clone(v));
            }
        }
        // Cluster names may contain '/'.
        views.values().find(|v| v.entities.contains_key(entity_id)).cloned()
    }

    pub fn status(&self, cluster: &str) -> Option<ClusterStatus> { self.status.load().get(cluster).cloned() }

    pub fn statuses(&self) -> Vec<ClusterStatus> {
        let mut out: Vec<_> = self.status.load().values().cloned().collect();
        out.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        out
    }

    pub fn locator(&self) -> Arc<LocatorStatus> { self.locator.load_full() }

    pub fn set_locator(&self, status: LocatorStatus) { self.locator.store(Arc::new(status)); }

    pub fn publish_view(&self, view: ClusterView) {
        let view = Arc::new(view);
        self.views.rcu(|m| {
            let mut m = FxHashMap::clone(m);
            m.insert(view.cluster.clone(), Arc::clone(&view));
            m
        });
        self.bump();
    }

    /// Update (or create) the status entry for `cluster`.
    pub fn update_status<F>(&self, cluster: &str, mut f: F) -> ClusterStatus
    where
        F: FnMut(&mut ClusterStatus),
    {
        let mut updated = ClusterStatus::default();
        self.status.rcu(|m| {
            let mut m = FxHashMap::clone(m);
            let entry = m
                .entry(cluster.to_string())
                .or_insert_with(|| ClusterStatus { cluster: cluster.to_string(), ..Default::default() });
            f(entry);
            updated = entry.clone();
            m
        });
        updated
    }

    /// Update the status entry for `cluster` only if it exists.
    pub fn update_existing<F>(&self, cluster: &str, mut f: F) -> Option<ClusterStatus>
    where
        F: FnMut(&mut ClusterStatus),
    {
        let mut updated = None;
        self.status.rcu(|m| {
            updated = None;
            let mut m = FxHashMap::clone(m);
            if let Some(entry) = m.get_mut(cluster) {
                f(entry);
                updated = Some(entry.clone());
            }
            m
        });
        updated
    }

    /// Move a running cycle to `state`. A forgotten cluster stays forgotten.
    pub fn set_state(&self, cluster: &str, state: CycleState) {
        self.update_existing(cluster, |s| s.state = state);
    }

    /// Record a skipped or failed cycle. Returns the new failure streak.
    pub fn record_failure(&self, cluster: &str, errors: Vec<CycleError>) -> u32 {
        let now = Utc::now();
        let status = self.update_status(cluster, |s| {
            s.state = CycleState::Failed;
            s.cycles += 1;
            s.last_finished_at = Some(now);
            s.consecutive_failures = s.consecutive_failures.saturating_add(1);
            s.error_count = errors.len();
            s.last_errors = errors.clone();
        });
        self.bump();
        status.consecutive_failures
    }

    /// Drop everything known about a cluster that is no longer configured.
    pub fn forget(&self, cluster: &str) {
        self.views.rcu(|m| {
            let mut m = FxHashMap::clone(m);
            m.remove(cluster);
            m
        });
        self.status.rcu(|m| {
            let mut m = FxHashMap::clone(m);
            m.remove(cluster);
            m
        });
        self.bump();
    }
}
