//! Several [`LocalZone`]s wired together in one process.
//!
//! Zones talk through an unbounded queue instead of calling each other
//! directly, so one zone's mutation never re-enters another while it holds
//! its own state. [`LocalCluster::settle`] drains the queue until no zone has
//! anything left to say.

use crate::graph::Graph;
use crate::instrumentation::Instrumentation;
use crate::naive;
use crate::zone::{LocalZone, Mutation, ZoneLink};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use zonegraph_client::{GraphQueryClient, OperationIssuer, QueryStrategy};
use zonegraph_core::{
    EdgeId, Event, EventStats, Permissions, VertexId, VertexType, ZoneError, ZoneId, ZoneResult,
};

#[derive(Debug)]
enum Envelope {
    Forward { zone: ZoneId, mutation: Mutation },
    Event { target: VertexId, event: Event },
}

struct QueueLink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl QueueLink {
    fn push(&self, envelope: Envelope) -> ZoneResult<()> {
        self.tx
            .send(envelope)
            .map_err(|_| ZoneError::Internal("cluster queue closed".into()))
    }
}

#[async_trait]
impl ZoneLink for QueueLink {
    async fn forward(&self, zone: &ZoneId, mutation: &Mutation) -> ZoneResult<()> {
        self.push(Envelope::Forward {
            zone: zone.clone(),
            mutation: mutation.clone(),
        })
    }

    async fn post_event(&self, target: &VertexId, event: &Event) -> ZoneResult<()> {
        self.push(Envelope::Event {
            target: target.clone(),
            event: event.clone(),
        })
    }
}

pub struct LocalCluster {
    zones: BTreeMap<ZoneId, Arc<LocalZone>>,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl LocalCluster {
    /// One zone per id, all sharing `instrumentation`.
    pub fn new(zones: impl IntoIterator<Item = ZoneId>, instrumentation: &Instrumentation) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let link: Arc<dyn ZoneLink> = Arc::new(QueueLink { tx });
        let zones = zones
            .into_iter()
            .map(|id| {
                let zone = LocalZone::new(id.clone(), instrumentation.clone()).with_link(link.clone());
                (id, Arc::new(zone))
            })
            .collect();
        Self {
            zones,
            inbox: Mutex::new(rx),
        }
    }

    pub fn zone(&self, id: &ZoneId) -> ZoneResult<&Arc<LocalZone>> {
        self.zones
            .get(id)
            .ok_or_else(|| ZoneError::UnknownZone(id.clone()))
    }

    pub fn zones(&self) -> impl Iterator<Item = &Arc<LocalZone>> {
        self.zones.values()
    }

    /// Bootstraps every zone, then delivers whatever that produced.
    pub async fn bootstrap(&self) -> ZoneResult<()> {
        for zone in self.zones.values() {
            zone.bootstrap().await?;
        }
        self.settle().await?;
        Ok(())
    }

    /// Delivers queued mutations and events until the queue is empty.
    /// Returns how many were delivered.
    pub async fn settle(&self) -> ZoneResult<usize> {
        let mut inbox = self.inbox.lock().await;
        let mut delivered = 0;
        while let Ok(envelope) = inbox.try_recv() {
            match envelope {
                Envelope::Forward { zone, mutation } => {
                    self.zone(&zone)?.apply(mutation, true).await?;
                }
                Envelope::Event { target, event } => {
                    self.zone(target.owner())?.handle_event(&target, event).await?;
                }
            }
            delivered += 1;
        }
        tracing::debug!(delivered, "cluster settled");
        Ok(delivered)
    }

    /// Counters summed over every zone.
    pub fn event_stats(&self) -> EventStats {
        let mut total = EventStats::default();
        for zone in self.zones.values() {
            total.merge(&zone.event_stats());
        }
        total
    }

    pub fn query(&self, strategy: QueryStrategy) -> ClusterQuery<'_> {
        ClusterQuery {
            cluster: self,
            strategy,
        }
    }

    async fn graphs(&self) -> Vec<Graph> {
        let mut graphs = Vec::with_capacity(self.zones.len());
        for zone in self.zones.values() {
            graphs.push(zone.graph().await);
        }
        graphs
    }
}

/// Mutations are routed to the named zone and the cluster is settled before
/// returning.
#[async_trait]
impl OperationIssuer for LocalCluster {
    async fn add_edge(&self, zone: &ZoneId, edge: &EdgeId, permissions: Permissions) -> ZoneResult<()> {
        self.zone(zone)?.add_edge(zone, edge, permissions).await?;
        self.settle().await.map(|_| ())
    }

    async fn remove_edge(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<()> {
        self.zone(zone)?.remove_edge(zone, edge).await?;
        self.settle().await.map(|_| ())
    }

    async fn set_permissions(
        &self,
        zone: &ZoneId,
        edge: &EdgeId,
        permissions: Permissions,
    ) -> ZoneResult<()> {
        self.zone(zone)?.set_permissions(zone, edge, permissions).await?;
        self.settle().await.map(|_| ())
    }

    async fn add_vertex(&self, id: &VertexId, kind: VertexType) -> ZoneResult<()> {
        self.zone(id.owner())?.add_vertex(id.clone(), kind).await
    }
}

/// Naive answers walk the union of every zone's graph; indexed answers come
/// from the index of the named zone.
#[derive(Clone, Copy)]
pub struct ClusterQuery<'a> {
    cluster: &'a LocalCluster,
    strategy: QueryStrategy,
}

#[async_trait]
impl GraphQueryClient for ClusterQuery<'_> {
    async fn reaches(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<bool> {
        let local = self.cluster.zone(zone)?;
        Ok(match self.strategy {
            QueryStrategy::Naive => naive::reaches(&self.cluster.graphs().await[..], edge),
            QueryStrategy::Indexed => local.index().reaches(edge).await,
        })
    }

    async fn members(&self, zone: &ZoneId, of: &VertexId) -> ZoneResult<Vec<VertexId>> {
        let local = self.cluster.zone(zone)?;
        Ok(match self.strategy {
            QueryStrategy::Naive => naive::members(&self.cluster.graphs().await[..], of),
            QueryStrategy::Indexed => local.index().members(of).await,
        })
    }

    async fn effective_permissions(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<Permissions> {
        let local = self.cluster.zone(zone)?;
        Ok(match self.strategy {
            QueryStrategy::Naive => {
                naive::effective_permissions(&self.cluster.graphs().await[..], edge)
            }
            QueryStrategy::Indexed => local.index().effective_permissions(edge).await,
        })
    }
}
