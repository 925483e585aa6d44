//! kgraph entity normalizer: graph nodes to catalog entities.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kgraph_core::{
    EntityKind, KindSelector, NormalizedEntity, RawResource, Relation, RelationType, ValidationError, CLUSTER_SCOPED,
};
use kgraph_graph::{LinkKind, NodeId, ResourceForest};
use rustc_hash::FxHashMap;
use tracing::warn;

/// Kinds classified as compositions when no selector role says otherwise.
const COMPOSITION_KINDS: &[&str] = &["Composition", "ResourceGraphDefinition"];

/// Deterministic entity id: `{cluster}/{kind}/{namespace|cluster-scoped}/{name}`.
pub fn entity_id(r: &RawResource) -> Result<String, ValidationError> {
    if r.name.is_empty() {
        return Err(ValidationError::MissingName { kind: r.kind.clone(), uid: r.uid.clone() });
    }
    let ns = if r.namespaced {
        r.namespace
            .as_deref()
            .filter(|ns| !ns.trim().is_empty())
            .ok_or_else(|| ValidationError::MissingNamespace { kind: r.kind.clone(), name: r.name.clone() })?
    } else {
        CLUSTER_SCOPED
    };
    Ok(format!("{}/{}/{}/{}", r.cluster, r.kind.to_lowercase(), ns, r.name))
}

/// Entities of one forest, in breadth-first emission order, plus the nodes
/// that were excluded.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub entities: Vec<NormalizedEntity>,
    /// `sources[i]` is the node `entities[i]` was derived from.
    pub sources: Vec<NodeId>,
    pub invalid: Vec<(NodeId, ValidationError)>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    prefix: String,
    /// selector key -> role
    roles: FxHashMap<String, EntityKind>,
}

impl Normalizer {
    pub fn new(annotation_prefix: &str) -> Self {
        Self { prefix: annotation_prefix.trim_end_matches('/').to_string(), roles: FxHashMap::default() }
    }

    /// Register role hints from the configured selectors.
    pub fn with_selectors(mut self, selectors: &[KindSelector]) -> Self {
        for s in selectors {
            if let Some(role) = s.role {
                self.roles.insert(s.key(), role);
            }
        }
        self
    }

    pub fn prefix(&self) -> &str { &self.prefix }

    fn annotation(&self, suffix: &str) -> String { format!("{}/{}", self.prefix, suffix) }

    /// Normalize a single node. Relations only point at nodes that normalize
    /// successfully themselves.
    pub fn normalize(&self, forest: &ResourceForest, id: NodeId) -> Result<NormalizedEntity, ValidationError> {
        let node = forest.node(id);
        let r = &node.resource;
        let own_id = entity_id(r)?;
        let target = |other: NodeId| entity_id(&forest.node(other).resource).ok();

        let mut relations = Vec::new();
        if let Some(parent_id) = node.parent.and_then(target) {
            relations.push(Relation { relation_type: RelationType::OwnedBy, target_id: parent_id });
        }
        for child_id in node.children.iter().filter_map(|&c| target(c)) {
            relations.push(Relation { relation_type: RelationType::Owns, target_id: child_id });
        }
        for link in forest.links_from(id) {
            if let Some(t) = target(link.to) {
                relations.push(Relation { relation_type: RelationType::DependsOn, target_id: t });
            }
        }
        for link in forest.links_to(id) {
            if let Some(t) = target(link.from) {
                relations.push(Relation { relation_type: RelationType::DependencyOf, target_id: t });
            }
        }

        let mut annotations: BTreeMap<String, String> = r.annotations.clone();
        annotations.insert(self.annotation("cluster"), r.cluster.clone());
        annotations.insert(self.annotation("kind"), r.kind.clone());
        annotations.insert(self.annotation("api-version"), r.full_api_version());
        if let Some(root_id) = target(forest.root_of(id)) {
            annotations.insert(self.annotation("graph-root"), root_id);
        }
        if let Some(comp) = forest.links_from(id).find(|l| l.kind == LinkKind::UsesComposition) {
            annotations.insert(self.annotation("composition"), forest.node(comp.to).resource.name.clone());
        }

        Ok(NormalizedEntity {
            id: own_id,
            kind: self.classify(forest, id),
            cluster: r.cluster.clone(),
            namespace: if r.namespaced { r.namespace.clone() } else { None },
            name: r.name.clone(),
            source_api_version: r.full_api_version(),
            source_kind: r.kind.clone(),
            labels: r.labels.clone(),
            annotations,
            relations,
            spec: r.spec.clone(),
            status: r.status.clone(),
        })
    }

    fn classify(&self, forest: &ResourceForest, id: NodeId) -> EntityKind {
        let node = forest.node(id);
        if let Some(role) = self.roles.get(&node.resource.selector) {
            return *role;
        }
        if COMPOSITION_KINDS.contains(&node.resource.kind.as_str()) {
            return EntityKind::Composition;
        }
        if node.parent.is_some() {
            return EntityKind::Managed;
        }
        let composes = forest.links_from(id).any(|l| l.kind != LinkKind::UsesComposition);
        if !node.children.is_empty() || composes {
            return EntityKind::Root;
        }
        EntityKind::Other
    }

    /// Normalize every node in emission order. Invalid resources are logged
    /// and excluded rather than failing the batch.
    pub fn normalize_forest(&self, forest: &ResourceForest) -> Normalized {
        let mut out = Normalized::default();
        for node in forest.iter_bfs() {
            match self.normalize(forest, node.id) {
                Ok(e) => {
                    out.entities.push(e);
                    out.sources.push(node.id);
                }
                Err(err) => {
                    warn!(cluster = %node.resource.cluster, uid = %node.resource.uid, error = %err, "normalize: resource excluded");
                    out.invalid.push((node.id, err));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgraph_core::OwnerRef;

    fn res(kind: &str, name: &str, uid: &str, ns: Option<&str>, owner: Option<&str>) -> RawResource {
        RawResource {
            cluster: "cluster-1".into(),
            api_group: "example.org".into(),
            api_version: "v1".into(),
            kind: kind.into(),
            namespaced: ns.is_some(),
            namespace: ns.map(String::from),
            name: name.into(),
            uid: uid.into(),
            resource_version: "3".into(),
            owner_refs: owner.map(|o| OwnerRef::new(o, "XThing")).into_iter().collect(),
            labels: Default::default(),
            annotations: BTreeMap::from([("note".to_string(), "kept".to_string())]),
            spec: serde_json::json!({ "a": 1 }),
            status: serde_json::json!({ "ready": true }),
            selector: format!("example.org/v1/{}", kind),
        }
    }

    #[test]
    fn ids_follow_naming_convention() {
        assert_eq!(entity_id(&res("XBucket", "b", "1", Some("team-a"), None)).unwrap(), "cluster-1/xbucket/team-a/b");
        assert_eq!(entity_id(&res("Composition", "c", "2", None, None)).unwrap(), "cluster-1/composition/cluster-scoped/c");
    }

    #[test]
    fn namespaced_kind_without_namespace_is_invalid() {
        let mut r = res("XBucket", "b", "1", Some(""), None);
        assert!(matches!(entity_id(&r), Err(ValidationError::MissingNamespace { .. })));
        r.namespace = None;
        assert!(matches!(entity_id(&r), Err(ValidationError::MissingNamespace { .. })));
    }

    #[test]
    fn synthesized_annotations_and_relations() {
        let forest = kgraph_graph::build(vec![
            res("XBucket", "root", "r", Some("ns"), None),
            res("Bucket", "child", "c", Some("ns"), Some("r")),
        ]);
        let n = Normalizer::new("terasky.backstage.io/");
        let root = n.normalize(&forest, 0).unwrap();
        let child = n.normalize(&forest, 1).unwrap();

        assert_eq!(root.kind, EntityKind::Root);
        assert_eq!(child.kind, EntityKind::Managed);
        assert_eq!(root.annotations["note"], "kept");
        assert_eq!(root.annotations["terasky.backstage.io/cluster"], "cluster-1");
        assert_eq!(child.annotations["terasky.backstage.io/kind"], "Bucket");
        assert_eq!(child.annotations["terasky.backstage.io/graph-root"], "cluster-1/xbucket/ns/root");
        assert_eq!(child.annotations["terasky.backstage.io/api-version"], "example.org/v1");
        assert_eq!(root.relations, vec![Relation { relation_type: RelationType::Owns, target_id: child.id.clone() }]);
        assert_eq!(child.relations, vec![Relation { relation_type: RelationType::OwnedBy, target_id: root.id.clone() }]);
        assert_eq!(child.spec, serde_json::json!({ "a": 1 }));
    }

    #[test]
    fn invalid_parent_is_excluded_and_not_referenced() {
        let forest = kgraph_graph::build(vec![
            res("XBucket", "root", "r", Some(""), None),
            res("Bucket", "child", "c", Some("ns"), Some("r")),
        ]);
        let out = Normalizer::new("p.io").normalize_forest(&forest);
        assert_eq!(out.entities.len(), 1);
        assert_eq!(out.invalid.len(), 1);
        assert_eq!(out.invalid[0].0, 0);
        assert!(out.entities[0].relations.is_empty());
        assert!(!out.entities[0].annotations.contains_key("p.io/graph-root"));
    }

    #[test]
    fn selector_role_overrides_structure() {
        let forest = kgraph_graph::build(vec![res("XLone", "x", "x", None, None), res("Composition", "c", "c", None, None)]);
        let plain = Normalizer::new("p.io");
        assert_eq!(plain.normalize(&forest, 0).unwrap().kind, EntityKind::Other);
        assert_eq!(plain.normalize(&forest, 1).unwrap().kind, EntityKind::Composition);
        let hinted = Normalizer::new("p.io")
            .with_selectors(&[KindSelector::new("example.org", "v1", "XLone").with_role(EntityKind::Root)]);
        assert_eq!(hinted.normalize(&forest, 0).unwrap().kind, EntityKind::Root);
    }

    #[test]
    fn composition_link_becomes_annotation_and_relation() {
        let mut xr = res("XBucket", "xb", "xr", None, None);
        xr.spec = serde_json::json!({ "compositionRef": { "name": "buckets" } });
        let forest = kgraph_graph::build(vec![xr, res("Composition", "buckets", "comp", None, None)]);
        let n = Normalizer::new("p.io");
        let e = n.normalize(&forest, 0).unwrap();
        assert_eq!(e.annotations["p.io/composition"], "buckets");
        assert_eq!(e.relations[0].relation_type, RelationType::DependsOn);
        let comp = n.normalize(&forest, 1).unwrap();
        assert_eq!(comp.relations[0], Relation { relation_type: RelationType::DependencyOf, target_id: e.id.clone() });
    }

    #[test]
    fn normalize_is_byte_for_byte_deterministic() {
        let build = || {
            kgraph_graph::build(vec![
                res("XBucket", "root", "r", Some("ns"), None),
                res("Bucket", "a", "a", Some("ns"), Some("r")),
                res("Bucket", "b", "b", Some("ns"), Some("r")),
            ])
        };
        let n = Normalizer::new("p.io");
        let first = serde_json::to_vec(&n.normalize_forest(&build()).entities).unwrap();
        let second = serde_json::to_vec(&n.normalize_forest(&build()).entities).unwrap();
        assert_eq!(first, second);
    }
}
