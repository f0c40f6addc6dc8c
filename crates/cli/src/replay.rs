//! `zonegraph replay`: loads a graph description into in-process zones,
//! optionally records notifications as NDJSON, and cross-checks the naive and
//! indexed strategies on every vertex pair.
//!
//! ```json
//! {
//!   "zones": ["eu", "us"],
//!   "vertices": [{ "id": "eu:alice", "type": "user" }],
//!   "edges": [{ "from": "eu:alice", "to": "us:admins", "permissions": "101" }]
//! }
//! ```
//!
//! An edge is issued to the zone owning its source unless `zone` says
//! otherwise.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use zonegraph_client::{GraphQueryClient, OperationIssuer, QueryStrategy};
use zonegraph_core::{EdgeId, EventStats, Permissions, VertexId, VertexType, ZoneId};
use zonegraph_index::{Instrumentation, InstrumentationConfig, JsonStreamSink, LocalCluster};

#[derive(Debug, Deserialize)]
pub struct GraphFile {
    #[serde(default)]
    pub zones: Vec<ZoneId>,
    #[serde(default)]
    pub vertices: Vec<VertexSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

#[derive(Debug, Deserialize)]
pub struct VertexSpec {
    pub id: VertexId,
    #[serde(rename = "type")]
    pub kind: VertexType,
}

#[derive(Debug, Deserialize)]
pub struct EdgeSpec {
    pub from: VertexId,
    pub to: VertexId,
    pub permissions: Permissions,
    #[serde(default)]
    pub zone: Option<ZoneId>,
}

impl GraphFile {
    /// Declared zones plus the owner of every vertex mentioned.
    fn all_zones(&self) -> BTreeSet<ZoneId> {
        let mut zones: BTreeSet<ZoneId> = self.zones.iter().cloned().collect();
        zones.extend(self.all_vertices().into_iter().map(|v| v.owner().clone()));
        zones
    }

    fn all_vertices(&self) -> BTreeSet<VertexId> {
        self.vertices
            .iter()
            .map(|v| v.id.clone())
            .chain(self.edges.iter().flat_map(|e| [e.from.clone(), e.to.clone()]))
            .collect()
    }
}

#[derive(Debug)]
pub struct ReplayReport {
    pub zones: usize,
    pub edges: usize,
    pub pairs_checked: usize,
    pub mismatches: Vec<String>,
    pub stats: EventStats,
    pub notifications: usize,
    pub elapsed: Duration,
}

impl ReplayReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "zones:          {}", self.zones);
        let _ = writeln!(out, "edges:          {}", self.edges);
        let _ = writeln!(out, "pairs checked:  {}", self.pairs_checked);
        let _ = writeln!(out, "events:         {}", self.stats.total);
        let _ = writeln!(out, "outbox:         {}", self.stats.outbox);
        let _ = writeln!(out, "notifications:  {}", self.notifications);
        let _ = writeln!(out, "elapsed:        {} ms", self.elapsed.as_millis());
        let _ = writeln!(out, "mismatches:     {}", self.mismatches.len());
        for m in &self.mismatches {
            let _ = writeln!(out, "  {m}");
        }
        out
    }
}

pub fn load(path: &Path) -> Result<GraphFile, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&raw)?)
}

pub async fn run(
    path: &Path,
    config: &InstrumentationConfig,
) -> Result<ReplayReport, Box<dyn std::error::Error>> {
    let t0 = Instant::now();
    let file = load(path)?;

    let writer: Box<dyn Write + Send> = match &config.report_path {
        Some(report) if config.enabled => Box::new(std::fs::File::create(report)?),
        _ => Box::new(std::io::stdout()),
    };
    let (instrumentation, worker) = Instrumentation::new(config, JsonStreamSink::new(writer));
    let handle = worker.spawn()?;

    let zones = file.all_zones();
    tracing::info!(zones = zones.len(), edges = file.edges.len(), "replaying graph");
    let cluster = LocalCluster::new(zones.iter().cloned(), &instrumentation);

    for vertex in &file.vertices {
        cluster.add_vertex(&vertex.id, vertex.kind).await?;
    }
    for edge in &file.edges {
        let zone = edge.zone.clone().unwrap_or_else(|| edge.from.owner().clone());
        let id = EdgeId::new(edge.from.clone(), edge.to.clone());
        cluster.add_edge(&zone, &id, edge.permissions).await?;
    }
    cluster.bootstrap().await?;

    let (pairs_checked, mismatches) = cross_check(&cluster, &file.all_vertices()).await?;
    let stats = cluster.event_stats();

    drop(cluster);
    let notifications = handle.stop().await?;
    tracing::info!(pairs_checked, mismatches = mismatches.len(), notifications, "replay done");

    Ok(ReplayReport {
        zones: zones.len(),
        edges: file.edges.len(),
        pairs_checked,
        mismatches,
        stats,
        notifications,
        elapsed: t0.elapsed(),
    })
}

/// Compares naive answers over all zones with the index of the zone owning
/// each target.
pub async fn cross_check(
    cluster: &LocalCluster,
    vertices: &BTreeSet<VertexId>,
) -> Result<(usize, Vec<String>), Box<dyn std::error::Error>> {
    let naive = cluster.query(QueryStrategy::Naive);
    let indexed = cluster.query(QueryStrategy::Indexed);
    let mut checked = 0;
    let mut mismatches = Vec::new();

    for to in vertices {
        let zone = to.owner();
        let (n, i) = (naive.members(zone, to).await?, indexed.members(zone, to).await?);
        if n != i {
            mismatches.push(format!("members of {to}: naive {n:?}, indexed {i:?}"));
        }

        for from in vertices {
            let edge = EdgeId::new(from.clone(), to.clone());
            let n = naive.effective_permissions(zone, &edge).await?;
            let i = indexed.effective_permissions(zone, &edge).await?;
            if n != i {
                mismatches.push(format!("effective permissions of {edge}: naive {n}, indexed {i}"));
            }
            let (n, i) = (naive.reaches(zone, &edge).await?, indexed.reaches(zone, &edge).await?);
            if n != i {
                mismatches.push(format!("reachability of {edge}: naive {n}, indexed {i}"));
            }
            checked += 1;
        }
    }
    Ok((checked, mismatches))
}
