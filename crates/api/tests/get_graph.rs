use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use kgraph_api::{AllowAll, ApiError, ClusterAllowList, GraphApi, GraphEdge, InProcApi};
use kgraph_core::{EntityKind, NormalizedEntity, Relation, RelationType};
use kgraph_store::{ClusterView, GraphIndex};
use rustc_hash::FxHashMap;
use uuid::Uuid;

fn entity(cluster: &str, id: &str, namespace: Option<&str>, relations: Vec<(RelationType, &str)>) -> NormalizedEntity {
    NormalizedEntity {
        id: id.into(),
        kind: EntityKind::Managed,
        cluster: cluster.into(),
        namespace: namespace.map(String::from),
        name: id.rsplit('/').next().unwrap().into(),
        source_api_version: "example.org/v1".into(),
        source_kind: "Bucket".into(),
        labels: Default::default(),
        annotations: Default::default(),
        relations: relations
            .into_iter()
            .map(|(relation_type, t)| Relation { relation_type, target_id: t.into() })
            .collect(),
        spec: serde_json::json!({}),
        status: serde_json::json!({}),
    }
}

const ROOT: &str = "c1/xbucket/team-a/root";
const A: &str = "c1/bucket/team-a/a";
const B: &str = "c1/bucket/team-b/b";
const STRAY: &str = "c1/bucket/team-a/stray";

/// root owns a (team-a) and b (team-b); `stray` is carried forward and in no graph.
fn index() -> Arc<GraphIndex> {
    let entities = vec![
        entity("c1", ROOT, Some("team-a"), vec![(RelationType::Owns, A), (RelationType::Owns, B)]),
        entity("c1", A, Some("team-a"), vec![(RelationType::OwnedBy, ROOT), (RelationType::DependsOn, B)]),
        entity("c1", B, Some("team-b"), vec![(RelationType::OwnedBy, ROOT), (RelationType::DependencyOf, A)]),
        entity("c1", STRAY, Some("team-a"), vec![]),
    ];
    let members = vec![ROOT.to_string(), A.to_string(), B.to_string()];
    let graph_of: FxHashMap<String, String> = members.iter().map(|m| (m.clone(), ROOT.to_string())).collect();
    let index = Arc::new(GraphIndex::new());
    index.publish_view(ClusterView {
        cluster: "c1".into(),
        cycle_id: Uuid::new_v4(),
        finished_at: Utc::now(),
        entities: entities.into_iter().map(|e| (e.id.clone(), e)).collect(),
        graphs: BTreeMap::from([(ROOT.to_string(), members)]),
        graph_of,
    });
    index
}

#[tokio::test]
async fn full_graph_for_unrestricted_caller() {
    let api = InProcApi::new(index());
    let g = api.get_graph(ROOT, &AllowAll).await.unwrap();
    let ids: Vec<&str> = g.nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec![ROOT, A, B]);
    assert_eq!(g.hidden, 0);
    assert_eq!(
        g.edges,
        vec![
            GraphEdge { from: ROOT.into(), to: A.into(), relation_type: RelationType::Owns },
            GraphEdge { from: ROOT.into(), to: B.into(), relation_type: RelationType::Owns },
            GraphEdge { from: A.into(), to: B.into(), relation_type: RelationType::DependsOn },
        ]
    );
}

#[tokio::test]
async fn unauthorized_members_and_their_edges_are_filtered() {
    let api = InProcApi::new(index());
    let team_a = |e: &NormalizedEntity| e.namespace.as_deref() == Some("team-a");
    let g = api.get_graph(ROOT, &team_a).await.unwrap();
    assert_eq!(g.nodes.len(), 2);
    assert_eq!(g.hidden, 1);
    assert!(g.edges.iter().all(|e| e.from != B && e.to != B));
    assert_eq!(g.edges.len(), 1);
}

#[tokio::test]
async fn unauthorized_root_is_forbidden() {
    let api = InProcApi::new(index());
    let other = ClusterAllowList(HashSet::from(["c2".to_string()]));
    assert_eq!(api.get_graph(ROOT, &other).await.unwrap_err(), ApiError::Forbidden(ROOT.into()));
}

#[tokio::test]
async fn non_root_and_unknown_ids() {
    let api = InProcApi::new(index());
    assert_eq!(
        api.get_graph(A, &AllowAll).await.unwrap_err(),
        ApiError::NotRoot { entity: A.into(), root: ROOT.into() }
    );
    assert_eq!(api.get_graph(STRAY, &AllowAll).await.unwrap_err(), ApiError::NotFound(STRAY.into()));
    assert!(matches!(api.get_graph("c9/x/y/z", &AllowAll).await, Err(ApiError::NotFound(_))));
}

#[tokio::test]
async fn cluster_status_lookup() {
    let index = index();
    index.update_status("c1", |s| s.state = kgraph_store::CycleState::Fetching);
    let api = InProcApi::new(index);
    assert_eq!(api.cluster_status("c1").await.unwrap().state, kgraph_store::CycleState::Fetching);
    assert_eq!(api.clusters().await.unwrap().len(), 1);
    assert!(matches!(api.cluster_status("nope").await, Err(ApiError::NotFound(_))));
}
