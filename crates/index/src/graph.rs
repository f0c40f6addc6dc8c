//! In-memory edge store of a single zone.
//!
//! A zone stores every edge with at least one endpoint it owns, so a
//! cross-zone edge lives in both zones.

use smallvec::SmallVec;
use std::collections::{BTreeSet, HashMap};
use zonegraph_core::{Edge, EdgeId, Permissions, VertexId, VertexType, ZoneError, ZoneId, ZoneResult};

/// Adjacency list; most vertices have only a handful of neighbours.
type Neighbours = SmallVec<[VertexId; 4]>;

#[derive(Debug, Clone)]
pub struct Graph {
    zone: ZoneId,
    vertices: HashMap<VertexId, VertexType>,
    edges: HashMap<EdgeId, Permissions>,
    children: HashMap<VertexId, Neighbours>,
    parents: HashMap<VertexId, Neighbours>,
}

impl Graph {
    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            vertices: HashMap::new(),
            edges: HashMap::new(),
            children: HashMap::new(),
            parents: HashMap::new(),
        }
    }

    pub fn zone(&self) -> &ZoneId {
        &self.zone
    }

    pub fn owns(&self, id: &VertexId) -> bool {
        id.owner() == &self.zone
    }

    pub fn add_vertex(&mut self, id: VertexId, kind: VertexType) -> ZoneResult<()> {
        if !self.owns(&id) {
            return Err(ZoneError::InvalidInput(format!(
                "vertex {id} is not owned by zone {}",
                self.zone
            )));
        }
        self.vertices.insert(id, kind);
        Ok(())
    }

    pub fn vertex_type(&self, id: &VertexId) -> Option<VertexType> {
        self.vertices.get(id).copied()
    }

    /// Inserts or replaces an edge. Returns the previous permissions, if any.
    pub fn add_edge(&mut self, id: EdgeId, permissions: Permissions) -> ZoneResult<Option<Permissions>> {
        if !self.owns(&id.from) && !self.owns(&id.to) {
            return Err(ZoneError::InvalidInput(format!(
                "edge {id} does not touch zone {}",
                self.zone
            )));
        }

        let previous = self.edges.insert(id.clone(), permissions);
        if previous.is_none() {
            self.children.entry(id.from.clone()).or_default().push(id.to.clone());
            self.parents.entry(id.to).or_default().push(id.from);
        }
        Ok(previous)
    }

    pub fn remove_edge(&mut self, id: &EdgeId) -> Option<Permissions> {
        let removed = self.edges.remove(id)?;
        detach(&mut self.children, &id.from, &id.to);
        detach(&mut self.parents, &id.to, &id.from);
        Some(removed)
    }

    pub fn set_permissions(&mut self, id: &EdgeId, permissions: Permissions) -> ZoneResult<()> {
        match self.edges.get_mut(id) {
            Some(current) => {
                *current = permissions;
                Ok(())
            }
            None => Err(ZoneError::InvalidInput(format!("no edge {id}"))),
        }
    }

    pub fn is_adjacent(&self, id: &EdgeId) -> bool {
        self.edges.contains_key(id)
    }

    pub fn permissions(&self, id: &EdgeId) -> Option<Permissions> {
        self.edges.get(id).copied()
    }

    pub fn children(&self, of: &VertexId) -> &[VertexId] {
        self.children.get(of).map(|c| c.as_slice()).unwrap_or(&[])
    }

    pub fn parents(&self, of: &VertexId) -> &[VertexId] {
        self.parents.get(of).map(|p| p.as_slice()).unwrap_or(&[])
    }

    /// Children of `of`, sorted.
    pub fn list_adjacent(&self, of: &VertexId) -> Vec<VertexId> {
        sorted(self.children(of))
    }

    /// Parents of `of`, sorted.
    pub fn list_adjacent_reversed(&self, of: &VertexId) -> Vec<VertexId> {
        sorted(self.parents(of))
    }

    /// Snapshot of every edge ending in `to`.
    pub fn edges_into(&self, to: &VertexId) -> Vec<Edge> {
        self.parents(to)
            .iter()
            .filter_map(|from| {
                let id = EdgeId::new(from.clone(), to.clone());
                self.edges.get(&id).map(|&permissions| Edge { id, permissions })
            })
            .collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.edges.iter().map(|(id, &permissions)| Edge {
            id: id.clone(),
            permissions,
        })
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Every vertex known to this zone: declared ones plus edge endpoints.
    pub fn vertex_ids(&self) -> BTreeSet<VertexId> {
        self.vertices
            .keys()
            .chain(self.children.keys())
            .chain(self.parents.keys())
            .cloned()
            .collect()
    }
}

fn detach(adjacency: &mut HashMap<VertexId, Neighbours>, key: &VertexId, neighbour: &VertexId) {
    if let Some(list) = adjacency.get_mut(key) {
        list.retain(|n| n != neighbour);
        if list.is_empty() {
            adjacency.remove(key);
        }
    }
}

fn sorted(ids: &[VertexId]) -> Vec<VertexId> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> VertexId {
        s.parse().unwrap()
    }

    fn e(from: &str, to: &str) -> EdgeId {
        EdgeId::new(v(from), v(to))
    }

    fn graph() -> Graph {
        Graph::new(ZoneId::new("a"))
    }

    #[test]
    fn adjacency_tracks_edges() {
        let mut g = graph();
        g.add_edge(e("a:u1", "a:g1"), "1".parse().unwrap()).unwrap();
        g.add_edge(e("a:u2", "a:g1"), "10".parse().unwrap()).unwrap();

        assert!(g.is_adjacent(&e("a:u1", "a:g1")));
        assert_eq!(g.list_adjacent_reversed(&v("a:g1")), vec![v("a:u1"), v("a:u2")]);
        assert_eq!(g.list_adjacent(&v("a:u1")), vec![v("a:g1")]);
        assert_eq!(g.edges_into(&v("a:g1")).len(), 2);

        assert_eq!(g.remove_edge(&e("a:u1", "a:g1")), Some("1".parse().unwrap()));
        assert!(!g.is_adjacent(&e("a:u1", "a:g1")));
        assert!(g.list_adjacent(&v("a:u1")).is_empty());
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn re_adding_replaces_permissions() {
        let mut g = graph();
        assert_eq!(g.add_edge(e("a:u1", "a:g1"), "1".parse().unwrap()).unwrap(), None);
        let previous = g.add_edge(e("a:u1", "a:g1"), "11".parse().unwrap()).unwrap();

        assert_eq!(previous, Some("1".parse().unwrap()));
        assert_eq!(g.children(&v("a:u1")).len(), 1);
        assert_eq!(g.permissions(&e("a:u1", "a:g1")), Some("11".parse().unwrap()));
    }

    #[test]
    fn rejects_foreign_edges_and_vertices() {
        let mut g = graph();
        assert!(g.add_edge(e("b:u1", "c:g1"), Permissions::NONE).is_err());
        assert!(g.add_vertex(v("b:u1"), VertexType::User).is_err());

        // Cross-zone edges touching this zone are kept.
        assert!(g.add_edge(e("b:u1", "a:g1"), Permissions::NONE).is_ok());

        g.add_vertex(v("a:u1"), VertexType::User).unwrap();
        assert_eq!(g.vertex_type(&v("a:u1")), Some(VertexType::User));
        assert_eq!(g.vertex_type(&v("b:u1")), None);
    }

    #[test]
    fn set_permissions_requires_edge() {
        let mut g = graph();
        assert!(g.set_permissions(&e("a:u1", "a:g1"), "1".parse().unwrap()).is_err());
    }
}
