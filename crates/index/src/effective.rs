//! Per-vertex derived state: effective permissions, the dirty flag, and the
//! intermediate vertices feeding them.
//!
//! An [`EffectiveVertex`] never fetches edges. Callers hand
//! [`EffectiveVertex::recalculate_permissions`] a snapshot of the candidate
//! edges and decide themselves how fresh that snapshot is. When a declared
//! intermediate vertex contributes no edge to the snapshot the vertex turns
//! dirty instead of failing.
//!
//! Concurrent recalculation of the same vertex must be serialized by the
//! owner, e.g. by keeping each vertex behind its own `tokio::sync::Mutex`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::mpsc;
use zonegraph_core::{Edge, Permissions, VertexId};

/// Outcome of one recalculation, as a transition of the dirty flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecalculationResult {
    /// Was clean, still clean.
    Clean,
    /// Was dirty, now clean.
    Cleaned,
    /// Dirty now, whatever it was before.
    Dirty,
}

impl RecalculationResult {
    pub fn from_transition(was_dirty: bool, is_dirty: bool) -> Self {
        match (was_dirty, is_dirty) {
            (_, true) => Self::Dirty,
            (true, false) => Self::Cleaned,
            (false, false) => Self::Clean,
        }
    }
}

impl fmt::Display for RecalculationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Clean => "CLEAN",
            Self::Cleaned => "CLEANED",
            Self::Dirty => "DIRTY",
        };
        f.write_str(s)
    }
}

/// Emitted when the intermediate set actually changes. Carries only the ids
/// that were added or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VertexModification {
    Added(Vec<VertexId>),
    Removed(Vec<VertexId>),
}

/// Subscriber to intermediate-set changes, typically the owning zone which
/// persists the vertex or schedules a recalculation.
pub trait ModificationObserver {
    fn modified(&self, modification: VertexModification);
}

/// Discards modifications.
impl ModificationObserver for () {
    fn modified(&self, _modification: VertexModification) {}
}

impl ModificationObserver for mpsc::UnboundedSender<VertexModification> {
    fn modified(&self, modification: VertexModification) {
        if self.send(modification).is_err() {
            tracing::debug!("modification subscriber gone");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveVertex {
    dirty: bool,
    effective_permissions: Permissions,
    intermediate_vertices: BTreeSet<VertexId>,
}

impl EffectiveVertex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn effective_permissions(&self) -> Permissions {
        self.effective_permissions
    }

    pub fn intermediate_vertices(&self) -> &BTreeSet<VertexId> {
        &self.intermediate_vertices
    }

    /// Replaces the dirty flag and returns the previous value.
    pub fn get_and_set_dirty(&mut self, dirty: bool) -> bool {
        std::mem::replace(&mut self.dirty, dirty)
    }

    pub fn add_intermediate_vertex(&mut self, id: VertexId, observer: &dyn ModificationObserver) {
        self.add_intermediate_vertices([id], observer);
    }

    /// Adds contributors. Notifies `observer` once, and only if the set grew.
    pub fn add_intermediate_vertices<I>(&mut self, ids: I, observer: &dyn ModificationObserver)
    where
        I: IntoIterator<Item = VertexId>,
    {
        let added: Vec<VertexId> = ids
            .into_iter()
            .filter(|id| self.intermediate_vertices.insert(id.clone()))
            .collect();
        if !added.is_empty() {
            observer.modified(VertexModification::Added(added));
        }
    }

    pub fn remove_intermediate_vertex(&mut self, id: &VertexId, observer: &dyn ModificationObserver) {
        self.remove_intermediate_vertices([id.clone()], observer);
    }

    /// Removes contributors. Notifies `observer` once, and only if the set shrank.
    pub fn remove_intermediate_vertices<I>(&mut self, ids: I, observer: &dyn ModificationObserver)
    where
        I: IntoIterator<Item = VertexId>,
    {
        let removed: Vec<VertexId> = ids
            .into_iter()
            .filter(|id| self.intermediate_vertices.remove(id))
            .collect();
        if !removed.is_empty() {
            observer.modified(VertexModification::Removed(removed));
        }
    }

    /// Recomputes the effective permissions from `edges`.
    ///
    /// Only edges whose source is an intermediate vertex contribute. The vertex
    /// is dirty when the number of contributing edges differs from the number
    /// of intermediate vertices. Edges are counted, not distinct sources, so
    /// two edges from one source can mask a missing one.
    ///
    /// Asynchronous so that an implementation may fetch missing edges from
    /// remote zones before completing.
    pub async fn recalculate_permissions(&mut self, edges: &[Edge]) -> RecalculationResult {
        let (calculated, dirty) = self.calculate(edges);
        let was_dirty = self.get_and_set_dirty(dirty);
        self.effective_permissions = calculated;
        RecalculationResult::from_transition(was_dirty, dirty)
    }

    fn calculate(&self, edges: &[Edge]) -> (Permissions, bool) {
        let mut matched = 0usize;
        let mut calculated = Permissions::NONE;
        for edge in edges {
            if self.intermediate_vertices.contains(edge.src()) {
                matched += 1;
                calculated = calculated.combine(edge.permissions);
            }
        }
        (calculated, matched != self.intermediate_vertices.len())
    }
}

impl fmt::Display for EffectiveVertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EffectiveVertex({} by [", self.effective_permissions)?;
        for (i, id) in self.intermediate_vertices.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id}")?;
        }
        f.write_str("])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct Counter(Cell<usize>);

    impl ModificationObserver for Counter {
        fn modified(&self, _modification: VertexModification) {
            self.0.set(self.0.get() + 1);
        }
    }

    fn v(s: &str) -> VertexId {
        s.parse().unwrap()
    }

    fn p(s: &str) -> Permissions {
        s.parse().unwrap()
    }

    fn edge(from: &str, perms: &str) -> Edge {
        Edge::new(v(from), v("z:target"), p(perms))
    }

    fn vertex_with(ids: &[&str]) -> EffectiveVertex {
        let mut ev = EffectiveVertex::new();
        ev.add_intermediate_vertices(ids.iter().map(|s| v(s)), &());
        ev
    }

    #[tokio::test]
    async fn missing_intermediate_leaves_vertex_dirty() {
        let mut ev = vertex_with(&["z:a", "z:b", "z:c"]);
        let edges = [edge("z:a", "001"), edge("z:b", "010"), edge("z:x", "100")];

        let result = ev.recalculate_permissions(&edges).await;

        assert_eq!(result, RecalculationResult::Dirty);
        assert!(ev.is_dirty());
        assert_eq!(ev.effective_permissions(), p("011"));
    }

    #[tokio::test]
    async fn supplying_last_edge_cleans() {
        let mut ev = vertex_with(&["z:a", "z:b", "z:c"]);
        let partial = [edge("z:a", "001"), edge("z:b", "010")];
        assert_eq!(ev.recalculate_permissions(&partial).await, RecalculationResult::Dirty);

        let complete = [edge("z:a", "001"), edge("z:b", "010"), edge("z:c", "100")];
        let result = ev.recalculate_permissions(&complete).await;

        assert_eq!(result, RecalculationResult::Cleaned);
        assert!(!ev.is_dirty());
        assert_eq!(ev.effective_permissions(), p("111"));
    }

    #[tokio::test]
    async fn converged_recalculation_stays_clean() {
        let mut ev = vertex_with(&["z:a", "z:b"]);
        let edges = [edge("z:a", "001"), edge("z:b", "001")];

        assert_eq!(ev.recalculate_permissions(&edges).await, RecalculationResult::Clean);
        assert_eq!(ev.recalculate_permissions(&edges).await, RecalculationResult::Clean);
        assert_eq!(ev.effective_permissions(), p("1"));
    }

    #[tokio::test]
    async fn dirty_twice_stays_dirty() {
        let mut ev = vertex_with(&["z:a"]);
        assert_eq!(ev.recalculate_permissions(&[]).await, RecalculationResult::Dirty);
        assert_eq!(ev.recalculate_permissions(&[]).await, RecalculationResult::Dirty);
        assert_eq!(ev.effective_permissions(), Permissions::NONE);
    }

    #[tokio::test]
    async fn duplicate_source_edges_mask_missing_intermediate() {
        // Edges are counted rather than sources: two edges from `a` hide the
        // absence of `b`.
        let mut ev = vertex_with(&["z:a", "z:b"]);
        let edges = [
            edge("z:a", "001"),
            Edge::new(v("z:a"), v("z:other"), p("100")),
        ];

        let result = ev.recalculate_permissions(&edges).await;

        assert_eq!(result, RecalculationResult::Clean);
        assert!(!ev.is_dirty());
    }

    #[test]
    fn add_notifies_only_when_set_grows() {
        let counter = Counter::default();
        let mut ev = EffectiveVertex::new();

        ev.add_intermediate_vertices([v("z:a"), v("z:b")], &counter);
        ev.add_intermediate_vertex(v("z:b"), &counter);
        assert_eq!(counter.0.get(), 1);

        ev.add_intermediate_vertex(v("z:c"), &counter);
        assert_eq!(counter.0.get(), 2);
        assert_eq!(ev.intermediate_vertices().len(), 3);
    }

    #[test]
    fn removing_absent_vertex_is_silent() {
        let counter = Counter::default();
        let mut ev = vertex_with(&["z:a"]);

        ev.remove_intermediate_vertex(&v("z:nope"), &counter);
        assert_eq!(counter.0.get(), 0);

        ev.remove_intermediate_vertex(&v("z:a"), &counter);
        assert_eq!(counter.0.get(), 1);
        assert!(ev.intermediate_vertices().is_empty());
    }

    #[test]
    fn channel_observer_receives_changed_ids_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ev = vertex_with(&["z:a"]);

        ev.add_intermediate_vertices([v("z:a"), v("z:b")], &tx);

        assert_eq!(rx.try_recv().unwrap(), VertexModification::Added(vec![v("z:b")]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn get_and_set_dirty_returns_previous() {
        let mut ev = EffectiveVertex::new();
        assert!(!ev.get_and_set_dirty(true));
        assert!(ev.is_dirty());
        assert!(ev.get_and_set_dirty(true));
    }

    #[test]
    fn serializes_with_store_field_names() {
        let ev = vertex_with(&["z:a"]);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["dirty"], false);
        assert_eq!(json["effectivePermissions"], "0");
        assert_eq!(json["intermediateVertices"][0], "z:a");
    }
}
