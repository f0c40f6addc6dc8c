//! A zone served in-process: graph store, materialized index and event
//! handling behind the same contracts a remote zone exposes over RPC.
//!
//! Cross-zone propagation goes through a [`ZoneLink`]. After every change the
//! zone compares, for each edge leaving it, the set of vertices known to reach
//! the edge's source with what it last announced, and posts a
//! [`EventType::ChildChange`] or [`EventType::Detach`] to the destination only
//! when that set changed. Every announced vertex carries the zones it was
//! derived through; a zone drops entries that already passed through it and
//! withholds from a peer what it learned from that peer. A removal inside a
//! cycle spanning zones therefore withdraws the vertex everywhere, and
//! announcements stop once every zone agrees.

use crate::graph::Graph;
use crate::index::{known_ancestors, Feeds, Reach, ReindexSummary, ZoneIndex};
use crate::instrumentation::{Instrumentation, Notification, NotificationKind};
use crate::naive;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use zonegraph_client::{GraphQueryClient, OperationIssuer, QueryStrategy, ZoneClient};
use zonegraph_core::{
    DependentZonesDto, EdgeId, Event, EventStats, EventType, Permissions, VertexId, VertexType,
    ZoneError, ZoneId, ZoneResult,
};

/// A graph mutation addressed to one edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    AddEdge { edge: EdgeId, permissions: Permissions },
    RemoveEdge { edge: EdgeId },
    SetPermissions { edge: EdgeId, permissions: Permissions },
}

impl Mutation {
    pub fn edge(&self) -> &EdgeId {
        match self {
            Self::AddEdge { edge, .. } | Self::RemoveEdge { edge } | Self::SetPermissions { edge, .. } => {
                edge
            }
        }
    }
}

/// How a zone reaches its peers.
#[async_trait]
pub trait ZoneLink: Send + Sync {
    /// Applies `mutation` on `zone` as a successive mutation.
    async fn forward(&self, zone: &ZoneId, mutation: &Mutation) -> ZoneResult<()>;

    /// Delivers `event` to the zone owning `target`.
    async fn post_event(&self, target: &VertexId, event: &Event) -> ZoneResult<()>;
}

#[async_trait]
impl ZoneLink for ZoneClient {
    async fn forward(&self, zone: &ZoneId, mutation: &Mutation) -> ZoneResult<()> {
        match mutation {
            Mutation::AddEdge { edge, permissions } => {
                self.add_edge(zone, edge, *permissions, true).await
            }
            Mutation::RemoveEdge { edge } => self.remove_edge(zone, edge, true).await,
            Mutation::SetPermissions { edge, permissions } => {
                self.set_permissions(zone, edge, *permissions, true).await
            }
        }
    }

    async fn post_event(&self, target: &VertexId, event: &Event) -> ZoneResult<()> {
        ZoneClient::post_event(self, target, event).await
    }
}

struct ZoneState {
    graph: Graph,
    feeds: Feeds,
    /// Last reach set posted for each edge leaving this zone.
    announced: HashMap<EdgeId, Reach>,
}

#[derive(Default)]
struct Counters {
    processing: AtomicU64,
    queued: AtomicU64,
    outbox: AtomicU64,
    total: AtomicU64,
}

pub struct LocalZone {
    zone: ZoneId,
    state: Mutex<ZoneState>,
    index: ZoneIndex,
    ready: AtomicBool,
    /// Held by the one caller posting announcements.
    announcer: Mutex<()>,
    /// Set when the graph or feeds changed since the last announcement pass.
    announce_requested: AtomicBool,
    counters: Counters,
    traces: AtomicU64,
    instrumentation: Instrumentation,
    link: Option<Arc<dyn ZoneLink>>,
}

impl std::fmt::Debug for LocalZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalZone")
            .field("zone", &self.zone)
            .field("ready", &self.index_ready())
            .field("linked", &self.link.is_some())
            .finish()
    }
}

impl LocalZone {
    pub fn new(zone: ZoneId, instrumentation: Instrumentation) -> Self {
        Self {
            state: Mutex::new(ZoneState {
                graph: Graph::new(zone.clone()),
                feeds: Feeds::new(),
                announced: HashMap::new(),
            }),
            index: ZoneIndex::new(zone.clone(), instrumentation.clone()),
            ready: AtomicBool::new(false),
            announcer: Mutex::new(()),
            announce_requested: AtomicBool::new(false),
            counters: Counters::default(),
            traces: AtomicU64::new(0),
            instrumentation,
            link: None,
            zone,
        }
    }

    /// Connects the zone to its peers. Without a link cross-zone changes stay
    /// local.
    pub fn with_link(mut self, link: Arc<dyn ZoneLink>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn zone(&self) -> &ZoneId {
        &self.zone
    }

    pub fn index(&self) -> &ZoneIndex {
        &self.index
    }

    fn next_trace(&self) -> String {
        let n = self.traces.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.zone)
    }

    fn notify(&self, trace: &str, vertex: &VertexId, kind: NotificationKind) -> ZoneResult<()> {
        self.instrumentation
            .notify(Notification::now(self.zone.clone(), trace, vertex.clone(), kind))
    }

    fn check_zone(&self, zone: &ZoneId) -> ZoneResult<()> {
        if zone == &self.zone {
            Ok(())
        } else {
            Err(ZoneError::UnknownZone(zone.clone()))
        }
    }

    /// Indexes everything stored so far and marks the index ready.
    pub async fn bootstrap(&self) -> ZoneResult<ReindexSummary> {
        let trace = self.next_trace();
        let summary = {
            let state = self.state.lock().await;
            let all = state.graph.vertex_ids();
            self.index.reindex(&state.graph, &state.feeds, &all, &trace).await?
        };
        self.ready.store(true, Ordering::Release);
        tracing::info!(zone = %self.zone, pairs = self.index.len(), "index ready");
        Ok(summary)
    }

    pub fn index_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Applies a mutation locally, reindexes, forwards it to the other owning
    /// zone unless `successive`, and announces changed reach sets.
    pub async fn apply(&self, mutation: Mutation, successive: bool) -> ZoneResult<()> {
        let trace = self.next_trace();
        let edge = mutation.edge().clone();
        tracing::debug!(zone = %self.zone, %edge, ?mutation, successive, "apply");

        {
            let mut state = self.state.lock().await;
            match &mutation {
                Mutation::AddEdge { permissions, .. } => {
                    state.graph.add_edge(edge.clone(), *permissions)?;
                }
                Mutation::RemoveEdge { .. } => {
                    if state.graph.remove_edge(&edge).is_none() {
                        if !successive {
                            return Err(ZoneError::InvalidInput(format!("no edge {edge}")));
                        }
                        tracing::debug!(zone = %self.zone, %edge, "forwarded removal of unknown edge");
                    }
                }
                Mutation::SetPermissions { permissions, .. } => {
                    state.graph.set_permissions(&edge, *permissions)?;
                }
            }
            let touched = BTreeSet::from([edge.to.clone()]);
            self.index
                .reindex(&state.graph, &state.feeds, &touched, &trace)
                .await?;
        }

        if !successive {
            self.forward(&trace, &mutation).await?;
        }
        self.announce(&trace).await
    }

    /// Sends `mutation` to the zone owning the other endpoint, if any.
    async fn forward(&self, trace: &str, mutation: &Mutation) -> ZoneResult<()> {
        let edge = mutation.edge();
        let peer = [edge.from.owner(), edge.to.owner()]
            .into_iter()
            .find(|owner| *owner != &self.zone);
        let (Some(peer), Some(link)) = (peer, &self.link) else {
            return Ok(());
        };

        link.forward(peer, mutation).await?;
        self.counters.outbox.fetch_add(1, Ordering::Relaxed);
        self.notify(trace, &edge.to, NotificationKind::Forwarded)
    }

    /// Brings every peer up to date with this zone's reach sets.
    ///
    /// Only one caller posts at a time. A caller arriving while another is
    /// posting leaves a request behind and returns; the poster runs another
    /// pass, so the last set posted per edge is always computed from the
    /// latest state.
    async fn announce(&self, trace: &str) -> ZoneResult<()> {
        if self.link.is_none() {
            return Ok(());
        }

        self.announce_requested.store(true, Ordering::SeqCst);
        loop {
            let Ok(guard) = self.announcer.try_lock() else {
                return Ok(());
            };
            while self.announce_requested.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.announce_pass(trace).await {
                    self.announce_requested.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
            drop(guard);

            if !self.announce_requested.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    /// Posts a `ChildChange` for every outgoing cross-zone edge whose reach set
    /// changed and a `Detach` for every one that disappeared.
    async fn announce_pass(&self, trace: &str) -> ZoneResult<()> {
        let Some(link) = &self.link else {
            return Ok(());
        };

        let (events, current) = {
            let state = self.state.lock().await;
            let current: HashMap<EdgeId, Reach> = state
                .graph
                .edges()
                .filter(|e| state.graph.owns(e.src()) && !state.graph.owns(e.dst()))
                .map(|e| {
                    let toward = e.dst().owner();
                    let reach = known_ancestors(&state.graph, &state.feeds, e.src(), Some(toward));
                    (e.id, reach)
                })
                .collect();

            let mut events = Vec::new();
            for (edge, reach) in &current {
                if state.announced.get(edge) != Some(reach) {
                    events.push(announcement(trace, EventType::ChildChange, edge, reach));
                }
            }
            for edge in state.announced.keys().filter(|e| !current.contains_key(*e)) {
                events.push(announcement(trace, EventType::Detach, edge, &Reach::new()));
            }
            (events, current)
        };

        for (target, event) in &events {
            link.post_event(target, event).await?;
            self.counters.outbox.fetch_add(1, Ordering::Relaxed);
            self.notify(trace, target, NotificationKind::Forwarded)?;
        }

        self.state.lock().await.announced = current;
        Ok(())
    }

    /// Processes an event addressed to `target`, a vertex of this zone.
    pub async fn handle_event(&self, target: &VertexId, event: Event) -> ZoneResult<()> {
        if target.owner() != &self.zone {
            return Err(ZoneError::InvalidInput(format!(
                "event for {target} delivered to zone {}",
                self.zone
            )));
        }

        let trace = event.trace.clone();
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        let queued = self.notify(&trace, target, NotificationKind::Queued);
        self.counters.queued.fetch_sub(1, Ordering::Relaxed);
        queued?;

        self.counters.processing.fetch_add(1, Ordering::Relaxed);
        let result = match self.notify(&trace, target, NotificationKind::StartProcessing) {
            Ok(()) => self.process_event(target, event, &trace).await,
            Err(e) => Err(e),
        };
        self.counters.processing.fetch_sub(1, Ordering::Relaxed);
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(()) => self.notify(&trace, target, NotificationKind::EndProcessing)?,
            Err(e) => {
                tracing::warn!(zone = %self.zone, %target, %trace, error = %e, "event failed");
                self.notify(&trace, target, NotificationKind::Fail)?;
                return Err(e);
            }
        }
        self.announce(&trace).await
    }

    async fn process_event(&self, target: &VertexId, event: Event, trace: &str) -> ZoneResult<()> {
        let feed = EdgeId::new(event.sender.clone(), target.clone());
        let mut state = self.state.lock().await;
        match event.kind {
            EventType::ChildChange => {
                let mut reach = event.reach();
                reach.retain(|_, route| !route.contains(&self.zone));
                state.feeds.insert(feed, reach);
            }
            EventType::Detach => {
                state.feeds.remove(&feed);
            }
        }
        let touched = BTreeSet::from([target.clone()]);
        self.index
            .reindex(&state.graph, &state.feeds, &touched, trace)
            .await?;
        Ok(())
    }

    pub fn event_stats(&self) -> EventStats {
        EventStats {
            processing: self.counters.processing.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            outbox: self.counters.outbox.load(Ordering::Relaxed),
            total: self.counters.total.load(Ordering::Relaxed),
        }
    }

    /// Owners of foreign vertices fed by this zone, minus `exclude` and this
    /// zone.
    pub async fn dependent_zones(&self, exclude: &[ZoneId]) -> DependentZonesDto {
        let state = self.state.lock().await;
        DependentZonesDto::new(
            state
                .graph
                .edges()
                .filter(|e| state.graph.owns(e.src()))
                .map(|e| e.dst().owner().clone())
                .filter(|z| z != &self.zone && !exclude.contains(z)),
        )
    }

    pub async fn add_vertex(&self, id: VertexId, kind: VertexType) -> ZoneResult<()> {
        self.state.lock().await.graph.add_vertex(id, kind)
    }

    pub async fn is_adjacent(&self, edge: &EdgeId) -> bool {
        self.state.lock().await.graph.is_adjacent(edge)
    }

    pub async fn list_adjacent(&self, of: &VertexId) -> Vec<VertexId> {
        self.state.lock().await.graph.list_adjacent(of)
    }

    pub async fn list_adjacent_reversed(&self, of: &VertexId) -> Vec<VertexId> {
        self.state.lock().await.graph.list_adjacent_reversed(of)
    }

    pub async fn permissions(&self, edge: &EdgeId) -> ZoneResult<Permissions> {
        self.state
            .lock()
            .await
            .graph
            .permissions(edge)
            .ok_or_else(|| ZoneError::InvalidInput(format!("no edge {edge}")))
    }

    /// Copy of the locally stored graph.
    pub async fn graph(&self) -> Graph {
        self.state.lock().await.graph.clone()
    }

    pub fn query(&self, strategy: QueryStrategy) -> LocalQuery<'_> {
        LocalQuery { zone: self, strategy }
    }
}

fn announcement(trace: &str, kind: EventType, edge: &EdgeId, reach: &Reach) -> (VertexId, Event) {
    (
        edge.to.clone(),
        Event {
            trace: trace.to_string(),
            kind,
            sender: edge.from.clone(),
            original_sender: edge.from.clone(),
            effective_vertices: reach.keys().cloned().collect(),
            routes: reach.clone(),
        },
    )
}

#[async_trait]
impl OperationIssuer for LocalZone {
    async fn add_edge(&self, zone: &ZoneId, edge: &EdgeId, permissions: Permissions) -> ZoneResult<()> {
        self.check_zone(zone)?;
        self.apply(
            Mutation::AddEdge {
                edge: edge.clone(),
                permissions,
            },
            false,
        )
        .await
    }

    async fn remove_edge(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<()> {
        self.check_zone(zone)?;
        self.apply(Mutation::RemoveEdge { edge: edge.clone() }, false).await
    }

    async fn set_permissions(
        &self,
        zone: &ZoneId,
        edge: &EdgeId,
        permissions: Permissions,
    ) -> ZoneResult<()> {
        self.check_zone(zone)?;
        self.apply(
            Mutation::SetPermissions {
                edge: edge.clone(),
                permissions,
            },
            false,
        )
        .await
    }

    async fn add_vertex(&self, id: &VertexId, kind: VertexType) -> ZoneResult<()> {
        LocalZone::add_vertex(self, id.clone(), kind).await
    }
}

/// One evaluation strategy of a [`LocalZone`].
///
/// Naive answers walk the locally stored graph only; indexed answers also
/// cover vertices announced by other zones.
#[derive(Debug, Clone, Copy)]
pub struct LocalQuery<'a> {
    zone: &'a LocalZone,
    strategy: QueryStrategy,
}

impl LocalQuery<'_> {
    pub fn strategy(&self) -> QueryStrategy {
        self.strategy
    }
}

#[async_trait]
impl GraphQueryClient for LocalQuery<'_> {
    async fn reaches(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<bool> {
        self.zone.check_zone(zone)?;
        Ok(match self.strategy {
            QueryStrategy::Naive => naive::reaches(&self.zone.state.lock().await.graph, edge),
            QueryStrategy::Indexed => self.zone.index.reaches(edge).await,
        })
    }

    async fn members(&self, zone: &ZoneId, of: &VertexId) -> ZoneResult<Vec<VertexId>> {
        self.zone.check_zone(zone)?;
        Ok(match self.strategy {
            QueryStrategy::Naive => naive::members(&self.zone.state.lock().await.graph, of),
            QueryStrategy::Indexed => self.zone.index.members(of).await,
        })
    }

    async fn effective_permissions(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<Permissions> {
        self.zone.check_zone(zone)?;
        Ok(match self.strategy {
            QueryStrategy::Naive => {
                naive::effective_permissions(&self.zone.state.lock().await.graph, edge)
            }
            QueryStrategy::Indexed => self.zone.index.effective_permissions(edge).await,
        })
    }
}
