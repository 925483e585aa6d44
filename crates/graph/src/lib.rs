//! kgraph graph builder: turns a flat set of fetched resources into a forest
//! of ownership trees plus non-tree dependency links.
//!
//! Nodes live in an arena and are addressed by index. Parent resolution uses
//! the first owner reference whose uid is part of the fetched set, ignoring
//! references to the resource itself; owner references pointing outside the
//! set leave the node as a root. Owner
//! reference cycles are broken by dropping the edge that closes the cycle.

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use kgraph_core::RawResource;
use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, warn};

mod links;

pub use links::{DependencyLink, LinkKind, KRO_INSTANCE_ID_LABEL};

/// Arena index of a node.
pub type NodeId = usize;

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub resource: RawResource,
    pub parent: Option<NodeId>,
    /// Ordered by arena index.
    pub children: Vec<NodeId>,
}

/// One root and every node it transitively owns, in breadth-first order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceGraph {
    pub root: NodeId,
    pub nodes: Vec<NodeId>,
}

impl ResourceGraph {
    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
}

/// Parent edge dropped to break an owner-reference cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CutEdge {
    pub child: NodeId,
    pub parent: NodeId,
}

/// Owner reference whose uid is not part of the fetched set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingOwner {
    pub node: NodeId,
    pub owner_uid: String,
    pub owner_kind: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceForest {
    nodes: Vec<GraphNode>,
    graphs: Vec<ResourceGraph>,
    links: Vec<DependencyLink>,
    cut_edges: Vec<CutEdge>,
    dangling: Vec<DanglingOwner>,
    /// node -> index into `graphs`
    graph_of: Vec<usize>,
    /// node -> indexes into `links` where the node is `from` / `to`
    #[serde(skip)]
    links_out: Vec<SmallVec<[usize; 2]>>,
    #[serde(skip)]
    links_in: Vec<SmallVec<[usize; 2]>>,
}

impl ResourceForest {
    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }
    pub fn node(&self, id: NodeId) -> &GraphNode { &self.nodes[id] }
    pub fn nodes(&self) -> &[GraphNode] { &self.nodes }
    pub fn graphs(&self) -> &[ResourceGraph] { &self.graphs }
    pub fn links(&self) -> &[DependencyLink] { &self.links }
    pub fn cut_edges(&self) -> &[CutEdge] { &self.cut_edges }
    pub fn dangling(&self) -> &[DanglingOwner] { &self.dangling }

    /// Root of the graph containing `id`.
    pub fn root_of(&self, id: NodeId) -> NodeId { self.graphs[self.graph_of[id]].root }

    pub fn graph_containing(&self, id: NodeId) -> &ResourceGraph { &self.graphs[self.graph_of[id]] }

    pub fn find_by_uid(&self, cluster: &str, uid: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.resource.cluster == cluster && n.resource.uid == uid)
    }

    pub fn links_from(&self, id: NodeId) -> impl Iterator<Item = &DependencyLink> + '_ {
        self.links_out[id].iter().map(move |&i| &self.links[i])
    }

    pub fn links_to(&self, id: NodeId) -> impl Iterator<Item = &DependencyLink> + '_ {
        self.links_in[id].iter().map(move |&i| &self.links[i])
    }

    /// Nodes in emission order: graph by graph, breadth-first within each.
    pub fn iter_bfs(&self) -> impl Iterator<Item = &GraphNode> + '_ {
        self.graphs.iter().flat_map(move |g| g.nodes.iter().map(move |&id| &self.nodes[id]))
    }
}

/// Build the forest. Resources sharing `(cluster, uid)` collapse into one
/// node; the last one seen wins but keeps the first one's position.
pub fn build(resources: impl IntoIterator<Item = RawResource>) -> ResourceForest {
    let mut index: FxHashMap<(String, String), NodeId> = FxHashMap::default();
    let mut nodes: Vec<GraphNode> = Vec::new();
    for r in resources {
        let key = (r.cluster.clone(), r.uid.clone());
        match index.get(&key) {
            Some(&id) => {
                debug!(cluster = %r.cluster, uid = %r.uid, "graph: duplicate uid; keeping last seen");
                nodes[id].resource = r;
            }
            None => {
                let id = nodes.len();
                index.insert(key, id);
                nodes.push(GraphNode { id, resource: r, parent: None, children: Vec::new() });
            }
        }
    }

    let mut dangling = Vec::new();
    let mut parent: Vec<Option<NodeId>> = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let r = &node.resource;
        let mut resolved = None;
        for owner in r.owner_refs.iter().filter(|o| o.uid != r.uid) {
            match index.get(&(r.cluster.clone(), owner.uid.clone())) {
                Some(&p) if resolved.is_none() => resolved = Some(p),
                Some(_) => {}
                None => dangling.push(DanglingOwner {
                    node: node.id,
                    owner_uid: owner.uid.clone(),
                    owner_kind: owner.kind.clone(),
                }),
            }
        }
        parent.push(resolved);
    }

    let cut_edges = break_cycles(&mut parent);
    for cut in &cut_edges {
        let r = &nodes[cut.child].resource;
        warn!(cluster = %r.cluster, kind = %r.kind, name = %r.name, "graph: owner reference cycle; treating resource as root");
    }

    for id in 0..nodes.len() {
        nodes[id].parent = parent[id];
        if let Some(p) = parent[id] {
            nodes[p].children.push(id);
        }
    }

    let mut graphs = Vec::new();
    let mut graph_of = vec![usize::MAX; nodes.len()];
    for root in (0..nodes.len()).filter(|&id| parent[id].is_none()) {
        let mut order = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            graph_of[id] = graphs.len();
            order.push(id);
            queue.extend(nodes[id].children.iter().copied());
        }
        graphs.push(ResourceGraph { root, nodes: order });
    }

    let links = links::resolve(&nodes, &parent);
    let mut links_out = vec![SmallVec::new(); nodes.len()];
    let mut links_in = vec![SmallVec::new(); nodes.len()];
    for (i, l) in links.iter().enumerate() {
        links_out[l.from].push(i);
        links_in[l.to].push(i);
    }
    debug!(nodes = nodes.len(), graphs = graphs.len(), links = links.len(), cuts = cut_edges.len(), dangling = dangling.len(), "graph: built");
    ResourceForest { nodes, graphs, links, cut_edges, dangling, graph_of, links_out, links_in }
}

/// Walk each node toward its root. Revisiting a node already on the current
/// walk means the last step closed a cycle: that parent pointer is dropped
/// and the node it belonged to becomes a root.
fn break_cycles(parent: &mut [Option<NodeId>]) -> Vec<CutEdge> {
    const UNSEEN: u8 = 0;
    const ON_PATH: u8 = 1;
    const DONE: u8 = 2;
    let mut state = vec![UNSEEN; parent.len()];
    let mut cuts = Vec::new();
    let mut path = Vec::new();
    for start in 0..parent.len() {
        if state[start] != UNSEEN {
            continue;
        }
        let mut cur = start;
        loop {
            state[cur] = ON_PATH;
            path.push(cur);
            match parent[cur] {
                None => break,
                Some(p) if state[p] == DONE => break,
                Some(p) if state[p] == ON_PATH => {
                    cuts.push(CutEdge { child: cur, parent: p });
                    parent[cur] = None;
                    break;
                }
                Some(p) => cur = p,
            }
        }
        for id in path.drain(..) {
            state[id] = DONE;
        }
    }
    cuts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_cycles_cuts_closing_edge() {
        // 0 -> 1 -> 2 -> 0
        let mut parent = vec![Some(1), Some(2), Some(0)];
        let cuts = break_cycles(&mut parent);
        assert_eq!(cuts, vec![CutEdge { child: 2, parent: 0 }]);
        assert_eq!(parent, vec![Some(1), Some(2), None]);
    }

    #[test]
    fn break_cycles_handles_self_loop_and_tail() {
        // 3 -> 0 (self loop), 1 -> 2 -> 1
        let mut parent = vec![Some(0), Some(2), Some(1), Some(0)];
        let cuts = break_cycles(&mut parent);
        assert_eq!(cuts.len(), 2);
        assert_eq!(parent[0], None);
        assert_eq!(parent[3], Some(0));
        assert_eq!(parent.iter().filter(|p| p.is_none()).count(), 2);
    }

    #[test]
    fn break_cycles_leaves_acyclic_input_alone() {
        let mut parent = vec![None, Some(0), Some(0), Some(1)];
        assert!(break_cycles(&mut parent).is_empty());
        assert_eq!(parent, vec![None, Some(0), Some(0), Some(1)]);
    }
}
