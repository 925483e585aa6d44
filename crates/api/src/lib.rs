//! kgraph read API: per-root resource graphs filtered by caller permissions,
//! plus per-cluster ingestion status.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use kgraph_core::{NormalizedEntity, RelationType};
use kgraph_store::{ClusterStatus, GraphIndex, LocatorStatus};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Decides which entities a caller may see. Authorization policy lives
/// outside the engine; this is only the seam it plugs into.
pub trait Authorizer: Send + Sync {
    fn can_view(&self, entity: &NormalizedEntity) -> bool;
}

/// Sees everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_view(&self, _entity: &NormalizedEntity) -> bool { true }
}

/// Restricts visibility to a set of clusters.
#[derive(Debug, Clone, Default)]
pub struct ClusterAllowList(pub HashSet<String>);

impl Authorizer for ClusterAllowList {
    fn can_view(&self, entity: &NormalizedEntity) -> bool { self.0.contains(&entity.cluster) }
}

impl<F> Authorizer for F
where
    F: Fn(&NormalizedEntity) -> bool + Send + Sync,
{
    fn can_view(&self, entity: &NormalizedEntity) -> bool { self(entity) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub relation_type: RelationType,
}

/// One root entity and everything it transitively owns, as of the last
/// completed cycle for its cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityGraph {
    pub root: String,
    pub cluster: String,
    pub cycle_id: Uuid,
    pub as_of: DateTime<Utc>,
    /// Breadth-first from the root.
    pub nodes: Vec<NormalizedEntity>,
    pub edges: Vec<GraphEdge>,
    /// Members withheld by the authorizer.
    pub hidden: usize,
}

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not_root: {entity} belongs to graph {root}")]
    NotRoot { entity: String, root: String },
}

pub type ApiResult<T> = Result<T, ApiError>;

#[async_trait::async_trait]
pub trait GraphApi: Send + Sync {
    async fn get_graph(&self, root_id: &str, authz: &dyn Authorizer) -> ApiResult<EntityGraph>;
    async fn cluster_status(&self, cluster: &str) -> ApiResult<ClusterStatus>;
    async fn clusters(&self) -> ApiResult<Vec<ClusterStatus>>;
    async fn locator_status(&self) -> ApiResult<LocatorStatus>;
}

/// Serves reads straight from the in-process index.
pub struct InProcApi {
    index: Arc<GraphIndex>,
}

impl InProcApi {
    pub fn new(index: Arc<GraphIndex>) -> Self { Self { index } }
}

#[async_trait::async_trait]
impl GraphApi for InProcApi {
    async fn get_graph(&self, root_id: &str, authz: &dyn Authorizer) -> ApiResult<EntityGraph> {
        let t0 = Instant::now();
        let view = self.index.view_for_entity(root_id).ok_or_else(|| ApiError::NotFound(root_id.to_string()))?;
        let Some(members) = view.graphs.get(root_id) else {
            return Err(match view.graph_of.get(root_id) {
                Some(root) => ApiError::NotRoot { entity: root_id.to_string(), root: root.clone() },
                None => ApiError::NotFound(root_id.to_string()),
            });
        };
        let root = view.entities.get(root_id).ok_or_else(|| ApiError::NotFound(root_id.to_string()))?;
        if !authz.can_view(root) {
            debug!(root = %root_id, "api: get_graph root not visible");
            return Err(ApiError::Forbidden(root_id.to_string()));
        }

        let nodes: Vec<NormalizedEntity> = members
            .iter()
            .filter_map(|id| view.entities.get(id))
            .filter(|e| authz.can_view(e))
            .cloned()
            .collect();
        let visible: FxHashSet<&str> = nodes.iter().map(|e| e.id.as_str()).collect();
        // Inverse relations (ownedBy, dependencyOf) would only duplicate edges.
        let mut edges = Vec::new();
        for e in &nodes {
            for r in &e.relations {
                let forward = matches!(r.relation_type, RelationType::Owns | RelationType::DependsOn);
                if forward && visible.contains(r.target_id.as_str()) {
                    edges.push(GraphEdge { from: e.id.clone(), to: r.target_id.clone(), relation_type: r.relation_type });
                }
            }
        }
        let hidden = members.len().saturating_sub(nodes.len());
        info!(root = %root_id, nodes = nodes.len(), hidden, took_ms = %t0.elapsed().as_millis(), "api: get_graph ok");
        Ok(EntityGraph {
            root: root_id.to_string(),
            cluster: view.cluster.clone(),
            cycle_id: view.cycle_id,
            as_of: view.finished_at,
            nodes,
            edges,
            hidden,
        })
    }

    async fn cluster_status(&self, cluster: &str) -> ApiResult<ClusterStatus> {
        self.index.status(cluster).ok_or_else(|| ApiError::NotFound(cluster.to_string()))
    }

    async fn clusters(&self) -> ApiResult<Vec<ClusterStatus>> { Ok(self.index.statuses()) }

    async fn locator_status(&self) -> ApiResult<LocatorStatus> { Ok((*self.index.locator()).clone()) }
}
