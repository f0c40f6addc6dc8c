//! Materialized effective permissions of one zone.
//!
//! The index keeps one [`EffectiveVertex`] per `(ancestor, target)` pair. Its
//! intermediate vertices are every `x` such that `ancestor` is `x` or reaches
//! `x`, and `x -> target` is either a local edge or a feed declared by another
//! zone. A feed whose edge has not reached this zone yet leaves the pair
//! dirty until the edge arrives.
//!
//! Each vertex sits behind its own `tokio::sync::Mutex`: recalculations of
//! different pairs run concurrently, recalculations of one pair serialize.

use crate::effective::{EffectiveVertex, ModificationObserver, RecalculationResult, VertexModification};
use crate::graph::Graph;
use crate::instrumentation::{Instrumentation, Notification, NotificationKind};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use zonegraph_core::{EdgeId, Permissions, VertexId, ZoneId, ZoneResult};

/// Zones a reachability fact was derived through, origin first.
pub type Route = Vec<ZoneId>;

/// Vertices known to reach some vertex, each with the route it was derived
/// through.
pub type Reach = BTreeMap<VertexId, Route>;

/// Feeds declared by other zones: `sender -> target` mapped to every vertex
/// known to reach `sender`.
pub type Feeds = HashMap<EdgeId, Reach>;

type Slot = Arc<tokio::sync::Mutex<EffectiveVertex>>;

/// Counts of one [`ZoneIndex::reindex`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReindexSummary {
    /// Pairs whose intermediate set changed.
    pub modified: usize,
    pub clean: usize,
    pub cleaned: usize,
    pub dirty: usize,
}

impl ReindexSummary {
    pub fn recalculated(&self) -> usize {
        self.clean + self.cleaned + self.dirty
    }

    fn record(&mut self, result: RecalculationResult) {
        match result {
            RecalculationResult::Clean => self.clean += 1,
            RecalculationResult::Cleaned => self.cleaned += 1,
            RecalculationResult::Dirty => self.dirty += 1,
        }
    }
}

pub struct ZoneIndex {
    zone: ZoneId,
    vertices: Mutex<HashMap<EdgeId, Slot>>,
    instrumentation: Instrumentation,
}

/// Forwards modifications of one pair to the reindex pass that subscribed.
struct Subscription<'a> {
    key: &'a EdgeId,
    tx: &'a mpsc::UnboundedSender<(EdgeId, VertexModification)>,
}

impl ModificationObserver for Subscription<'_> {
    fn modified(&self, modification: VertexModification) {
        let _ = self.tx.send((self.key.clone(), modification));
    }
}

impl ZoneIndex {
    pub fn new(zone: ZoneId, instrumentation: Instrumentation) -> Self {
        Self {
            zone,
            vertices: Mutex::new(HashMap::new()),
            instrumentation,
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<EdgeId, Slot>> {
        self.vertices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Brings every pair in line with `graph` and `feeds`.
    ///
    /// Pairs are recalculated when their intermediate set changed, when their
    /// target is in `touched` (its incoming edges changed), or when they are
    /// still dirty. Each outcome is reported as a notification.
    pub async fn reindex(
        &self,
        graph: &Graph,
        feeds: &Feeds,
        touched: &BTreeSet<VertexId>,
        trace: &str,
    ) -> ZoneResult<ReindexSummary> {
        let mut desired = desired_intermediates(graph, feeds);

        let handles: Vec<(EdgeId, Slot)> = {
            let mut slots = self.slots();
            for key in desired.keys() {
                slots.entry(key.clone()).or_default();
            }
            slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = BTreeSet::new();

        for (key, slot) in &handles {
            let wanted = desired.remove(key).unwrap_or_default();
            let mut vertex = slot.lock().await;
            let current = vertex.intermediate_vertices();
            let added: Vec<VertexId> = wanted.difference(current).cloned().collect();
            let removed: Vec<VertexId> = current.difference(&wanted).cloned().collect();

            let subscription = Subscription { key, tx: &tx };
            vertex.add_intermediate_vertices(added, &subscription);
            vertex.remove_intermediate_vertices(removed, &subscription);

            if vertex.is_dirty() || touched.contains(&key.to) {
                pending.insert(key.clone());
            }
        }
        drop(tx);

        let mut summary = ReindexSummary::default();
        while let Some((key, modification)) = rx.recv().await {
            tracing::trace!(zone = %self.zone, pair = %key, ?modification, "intermediates changed");
            summary.modified += 1;
            pending.insert(key);
        }

        let slots: HashMap<EdgeId, Slot> = handles.into_iter().collect();
        let mut tasks = tokio::task::JoinSet::new();
        for key in pending {
            let Some(slot) = slots.get(&key).cloned() else {
                continue;
            };
            let edges = graph.edges_into(&key.to);
            tasks.spawn(async move {
                let mut vertex = slot.lock_owned().await;
                let result = vertex.recalculate_permissions(&edges).await;
                (key, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (key, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!(zone = %self.zone, error = %e, "recalculation task failed");
                    continue;
                }
            };
            summary.record(result);
            self.instrumentation.notify(Notification::now(
                self.zone.clone(),
                trace,
                key.to.clone(),
                NotificationKind::Recalculated { result },
            ))?;
        }

        self.prune();

        tracing::debug!(
            zone = %self.zone,
            modified = summary.modified,
            recalculated = summary.recalculated(),
            dirty = summary.dirty,
            "reindexed"
        );
        Ok(summary)
    }

    /// Drops pairs that no longer have any contributor.
    fn prune(&self) {
        self.slots().retain(|_, slot| match slot.try_lock() {
            Ok(vertex) => vertex.is_dirty() || !vertex.intermediate_vertices().is_empty(),
            Err(_) => true,
        });
    }

    fn slot(&self, key: &EdgeId) -> Option<Slot> {
        self.slots().get(key).cloned()
    }

    pub async fn get(&self, key: &EdgeId) -> Option<EffectiveVertex> {
        let slot = self.slot(key)?;
        let vertex = slot.lock().await;
        Some(vertex.clone())
    }

    /// Whether any intermediate vertex connects `key.from` to `key.to`.
    pub async fn reaches(&self, key: &EdgeId) -> bool {
        self.get(key)
            .await
            .is_some_and(|v| !v.intermediate_vertices().is_empty())
    }

    pub async fn effective_permissions(&self, key: &EdgeId) -> Permissions {
        self.get(key)
            .await
            .map_or(Permissions::NONE, |v| v.effective_permissions())
    }

    /// Ancestors with a materialized pair into `of`, sorted.
    pub async fn members(&self, of: &VertexId) -> Vec<VertexId> {
        let candidates: Vec<(EdgeId, Slot)> = self
            .slots()
            .iter()
            .filter(|(k, _)| &k.to == of)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut members = Vec::new();
        for (key, slot) in candidates {
            if !slot.lock().await.intermediate_vertices().is_empty() {
                members.push(key.from);
            }
        }
        members.sort();
        members
    }

    /// Every pair, sorted by key.
    pub async fn snapshot(&self) -> Vec<(EdgeId, EffectiveVertex)> {
        let handles: Vec<(EdgeId, Slot)> = self
            .slots()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut out = Vec::with_capacity(handles.len());
        for (key, slot) in handles {
            out.push((key, slot.lock().await.clone()));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every vertex known to reach `v`, through local edges or declared feeds.
///
/// Each vertex keeps its shortest route, ties broken by zone order. Feed
/// entries that already passed through this zone, or through `toward`, are
/// ignored: a zone never learns back what it announced itself, and never
/// tells a peer what it learned from that peer.
pub fn known_ancestors(
    graph: &Graph,
    feeds: &Feeds,
    v: &VertexId,
    toward: Option<&ZoneId>,
) -> Reach {
    let zone = graph.zone();
    let mut found = Reach::new();
    let mut pending = VecDeque::from([(v.clone(), vec![zone.clone()])]);

    while let Some((x, route)) = pending.pop_front() {
        if found.get(&x).is_some_and(|best| shorter(best, &route)) {
            continue;
        }

        let mut candidates: Vec<(VertexId, Route)> = graph
            .parents(&x)
            .iter()
            .map(|parent| (parent.clone(), route.clone()))
            .collect();

        for (feed, reach) in feeds.iter().filter(|(feed, _)| feed.to == x) {
            candidates.push((feed.from.clone(), route.clone()));
            for (ancestor, via) in reach {
                if via.iter().any(|z| route.contains(z) || Some(z) == toward) {
                    continue;
                }
                let mut joined = via.clone();
                joined.extend(route.iter().cloned());
                candidates.push((ancestor.clone(), joined));
            }
        }

        for (ancestor, route) in candidates {
            let improves = found
                .get(&ancestor)
                .map_or(true, |best| shorter(&route, best));
            if improves {
                found.insert(ancestor.clone(), route.clone());
                pending.push_back((ancestor, route));
            }
        }
    }
    found
}

fn shorter(a: &Route, b: &Route) -> bool {
    (a.len(), a) < (b.len(), b)
}

/// Desired intermediate sets of every `(ancestor, target)` pair.
///
/// Ancestors are independent of each other, so they are expanded in parallel.
fn desired_intermediates(graph: &Graph, feeds: &Feeds) -> HashMap<EdgeId, BTreeSet<VertexId>> {
    let mut ancestors = graph.vertex_ids();
    for (feed, reach) in feeds {
        ancestors.insert(feed.from.clone());
        ancestors.extend(reach.keys().cloned());
    }

    ancestors
        .par_iter()
        .flat_map_iter(|ancestor| {
            intermediates_from(graph, feeds, ancestor)
                .into_iter()
                .map(move |(target, via)| (EdgeId::new(ancestor.clone(), target), via))
        })
        .collect()
}

fn intermediates_from(
    graph: &Graph,
    feeds: &Feeds,
    ancestor: &VertexId,
) -> BTreeMap<VertexId, BTreeSet<VertexId>> {
    let mut out: BTreeMap<VertexId, BTreeSet<VertexId>> = BTreeMap::new();
    let mut seen = HashSet::from([ancestor.clone()]);
    let mut pending = VecDeque::from([ancestor.clone()]);

    // Feeds whose sender this ancestor is known to reach remotely.
    for (feed, reach) in feeds {
        if reach.contains_key(ancestor) {
            out.entry(feed.to.clone()).or_default().insert(feed.from.clone());
            if seen.insert(feed.to.clone()) {
                pending.push_back(feed.to.clone());
            }
        }
    }

    while let Some(x) = pending.pop_front() {
        let local = graph.children(&x).iter();
        let declared = feeds.keys().filter(|f| f.from == x).map(|f| &f.to);
        for child in local.chain(declared) {
            out.entry(child.clone()).or_default().insert(x.clone());
            if seen.insert(child.clone()) {
                pending.push_back(child.clone());
            }
        }
    }
    out
}
