//! Naive evaluation: answers every query by walking the graph.
//!
//! Works on one zone's [`Graph`] or, through the slice impl, on the union of
//! several zones' graphs.

use crate::graph::Graph;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use zonegraph_core::{Edge, EdgeId, Permissions, VertexId};

/// Read access to the edges a traversal may follow.
pub trait Adjacency {
    fn children_of(&self, v: &VertexId) -> Vec<VertexId>;
    fn parents_of(&self, v: &VertexId) -> Vec<VertexId>;
    fn edges_to(&self, v: &VertexId) -> Vec<Edge>;
}

impl Adjacency for Graph {
    fn children_of(&self, v: &VertexId) -> Vec<VertexId> {
        self.children(v).to_vec()
    }

    fn parents_of(&self, v: &VertexId) -> Vec<VertexId> {
        self.parents(v).to_vec()
    }

    fn edges_to(&self, v: &VertexId) -> Vec<Edge> {
        self.edges_into(v)
    }
}

/// Union of several zones. Cross-zone edges stored by both zones count once.
impl Adjacency for [Graph] {
    fn children_of(&self, v: &VertexId) -> Vec<VertexId> {
        let set: BTreeSet<VertexId> = self.iter().flat_map(|g| g.children(v).iter().cloned()).collect();
        set.into_iter().collect()
    }

    fn parents_of(&self, v: &VertexId) -> Vec<VertexId> {
        let set: BTreeSet<VertexId> = self.iter().flat_map(|g| g.parents(v).iter().cloned()).collect();
        set.into_iter().collect()
    }

    fn edges_to(&self, v: &VertexId) -> Vec<Edge> {
        let by_id: BTreeMap<EdgeId, Edge> = self
            .iter()
            .flat_map(|g| g.edges_into(v))
            .map(|e| (e.id.clone(), e))
            .collect();
        by_id.into_values().collect()
    }
}

/// Vertices reachable from `from` through at least one edge.
pub fn descendants<G: Adjacency + ?Sized>(graph: &G, from: &VertexId) -> BTreeSet<VertexId> {
    walk(from, |v| graph.children_of(v))
}

/// Vertices reaching `to` through at least one edge.
pub fn ancestors<G: Adjacency + ?Sized>(graph: &G, to: &VertexId) -> BTreeSet<VertexId> {
    walk(to, |v| graph.parents_of(v))
}

fn walk<F>(start: &VertexId, next: F) -> BTreeSet<VertexId>
where
    F: Fn(&VertexId) -> Vec<VertexId>,
{
    let mut seen = BTreeSet::new();
    let mut pending = VecDeque::from([start.clone()]);
    while let Some(v) = pending.pop_front() {
        for n in next(&v) {
            if seen.insert(n.clone()) {
                pending.push_back(n);
            }
        }
    }
    seen
}

pub fn reaches<G: Adjacency + ?Sized>(graph: &G, edge: &EdgeId) -> bool {
    descendants(graph, &edge.from).contains(&edge.to)
}

/// Every vertex reaching `of`, sorted.
pub fn members<G: Adjacency + ?Sized>(graph: &G, of: &VertexId) -> Vec<VertexId> {
    ancestors(graph, of).into_iter().collect()
}

/// Combines the permissions of every edge `x -> to` where `x` is `from` or
/// reachable from it.
pub fn effective_permissions<G: Adjacency + ?Sized>(graph: &G, edge: &EdgeId) -> Permissions {
    let mut sources = descendants(graph, &edge.from);
    sources.insert(edge.from.clone());
    Permissions::combine_all(
        graph
            .edges_to(&edge.to)
            .into_iter()
            .filter(|e| sources.contains(e.src()))
            .map(|e| e.permissions),
    )
}
