//! Dependency links that are not expressed as owner references:
//! Crossplane composition/resource refs and KRO instance labels.

use std::collections::HashSet;

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::{GraphNode, NodeId};

pub const KRO_INSTANCE_ID_LABEL: &str = "kro.run/instance-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkKind {
    /// Composite -> the Composition it selected.
    UsesComposition,
    /// Composite -> a resource listed in its resource refs.
    Composes,
    /// KRO instance -> a resource labelled with the instance uid.
    KroInstance,
}

/// `from` depends on `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DependencyLink {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: LinkKind,
}

fn composition_ref(spec: &serde_json::Value) -> Option<&str> {
    spec.get("compositionRef")
        .or_else(|| spec.get("crossplane").and_then(|c| c.get("compositionRef")))
        .and_then(|r| r.get("name"))
        .and_then(|n| n.as_str())
        .filter(|n| !n.is_empty())
}

fn resource_refs(spec: &serde_json::Value) -> impl Iterator<Item = &serde_json::Value> {
    spec.get("resourceRefs")
        .or_else(|| spec.get("crossplane").and_then(|c| c.get("resourceRefs")))
        .and_then(|r| r.as_array())
        .into_iter()
        .flatten()
}

pub(crate) fn resolve(nodes: &[GraphNode], parent: &[Option<NodeId>]) -> Vec<DependencyLink> {
    // (cluster, kind, namespace, name) -> node
    let mut by_name: FxHashMap<(&str, &str, Option<&str>, &str), NodeId> = FxHashMap::default();
    let mut by_uid: FxHashMap<(&str, &str), NodeId> = FxHashMap::default();
    for n in nodes {
        let r = &n.resource;
        by_name.insert((r.cluster.as_str(), r.kind.as_str(), r.namespace.as_deref(), r.name.as_str()), n.id);
        by_uid.insert((r.cluster.as_str(), r.uid.as_str()), n.id);
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |from: NodeId, to: NodeId, kind: LinkKind| {
        // Tree edges already carry the relationship.
        if from == to || parent[to] == Some(from) || parent[from] == Some(to) {
            return;
        }
        let link = DependencyLink { from, to, kind };
        if seen.insert(link) {
            out.push(link);
        }
    };

    for n in nodes {
        let r = &n.resource;
        if let Some(name) = composition_ref(&r.spec) {
            if let Some(&to) = by_name.get(&(r.cluster.as_str(), "Composition", None, name)) {
                push(n.id, to, LinkKind::UsesComposition);
            }
        }
        for rr in resource_refs(&r.spec) {
            let (Some(kind), Some(name)) = (rr.get("kind").and_then(|x| x.as_str()), rr.get("name").and_then(|x| x.as_str())) else {
                continue;
            };
            let ns = rr.get("namespace").and_then(|x| x.as_str());
            let candidates = [ns, r.namespace.as_deref(), None];
            let target = candidates
                .iter()
                .find_map(|ns| by_name.get(&(r.cluster.as_str(), kind, *ns, name)).copied());
            if let Some(to) = target {
                push(n.id, to, LinkKind::Composes);
            }
        }
        if let Some(instance_uid) = r.labels.get(KRO_INSTANCE_ID_LABEL) {
            if let Some(&from) = by_uid.get(&(r.cluster.as_str(), instance_uid.as_str())) {
                push(from, n.id, LinkKind::KroInstance);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use kgraph_core::{OwnerRef, RawResource};
    use serde_json::json;

    use super::*;

    fn res(kind: &str, name: &str, uid: &str, spec: serde_json::Value) -> RawResource {
        RawResource {
            cluster: "c1".into(),
            api_group: "example.org".into(),
            api_version: "v1".into(),
            kind: kind.into(),
            namespaced: false,
            namespace: None,
            name: name.into(),
            uid: uid.into(),
            resource_version: "1".into(),
            owner_refs: Default::default(),
            labels: Default::default(),
            annotations: Default::default(),
            spec,
            status: serde_json::Value::Null,
            selector: format!("example.org/v1/{}", kind),
        }
    }

    #[test]
    fn composite_links_to_composition_and_resource_refs() {
        let xr = res(
            "XBucket",
            "xb",
            "u-xr",
            json!({
                "compositionRef": { "name": "buckets" },
                "resourceRefs": [
                    { "apiVersion": "s3/v1", "kind": "Bucket", "name": "b-1" },
                    { "apiVersion": "s3/v1", "kind": "Bucket", "name": "missing" },
                    { "kind": "Policy" }
                ]
            }),
        );
        let comp = res("Composition", "buckets", "u-comp", json!({}));
        let bucket = res("Bucket", "b-1", "u-b", json!({}));
        let forest = crate::build(vec![xr, comp, bucket]);
        let links = forest.links();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0], DependencyLink { from: 0, to: 1, kind: LinkKind::UsesComposition });
        assert_eq!(links[1], DependencyLink { from: 0, to: 2, kind: LinkKind::Composes });
    }

    #[test]
    fn crossplane_v2_nested_refs_are_read() {
        let mut xr = res(
            "XApp",
            "app",
            "u-xr",
            json!({ "crossplane": { "compositionRef": { "name": "apps" }, "resourceRefs": [ { "kind": "Deployment", "name": "web" } ] } }),
        );
        xr.namespace = Some("team-a".into());
        let comp = res("Composition", "apps", "u-comp", json!({}));
        let mut deploy = res("Deployment", "web", "u-d", json!({}));
        deploy.namespace = Some("team-a".into());
        let forest = crate::build(vec![xr, comp, deploy]);
        let kinds: Vec<_> = forest.links().iter().map(|l| l.kind).collect();
        assert_eq!(kinds, vec![LinkKind::UsesComposition, LinkKind::Composes]);
    }

    #[test]
    fn owner_edge_suppresses_duplicate_link() {
        let xr = res("XBucket", "xb", "u-xr", json!({ "resourceRefs": [ { "kind": "Bucket", "name": "b-1" } ] }));
        let mut bucket = res("Bucket", "b-1", "u-b", json!({}));
        bucket.owner_refs.push(OwnerRef::new("u-xr", "XBucket"));
        let forest = crate::build(vec![xr, bucket]);
        assert!(forest.links().is_empty());
        assert_eq!(forest.node(1).parent, Some(0));
    }

    #[test]
    fn kro_instance_label_links_instance_to_resources() {
        let instance = res("WebApp", "shop", "u-inst", json!({}));
        let mut svc = res("Service", "shop-svc", "u-svc", json!({}));
        svc.labels.insert(KRO_INSTANCE_ID_LABEL.into(), "u-inst".into());
        let forest = crate::build(vec![instance, svc]);
        assert_eq!(forest.links(), &[DependencyLink { from: 0, to: 1, kind: LinkKind::KroInstance }]);
        // links never change the tree shape
        assert_eq!(forest.graphs().len(), 2);
    }
}
