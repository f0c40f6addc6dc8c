//! Zone RPC client and the contracts shared by local and remote zones.

pub mod config;
pub mod rpc;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use zonegraph_core::{EdgeId, Permissions, VertexId, VertexType, ZoneError, ZoneId, ZoneResult};

pub use config::{ClientConfig, StaticResolver, ZoneResolver};
pub use rpc::{StrategyClient, ZoneClient};

/// Graph mutations, issued either against the local store or a remote zone.
#[async_trait]
pub trait OperationIssuer: Send + Sync {
    async fn add_edge(&self, zone: &ZoneId, edge: &EdgeId, permissions: Permissions)
        -> ZoneResult<()>;
    async fn remove_edge(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<()>;
    async fn set_permissions(
        &self,
        zone: &ZoneId,
        edge: &EdgeId,
        permissions: Permissions,
    ) -> ZoneResult<()>;
    async fn add_vertex(&self, id: &VertexId, kind: VertexType) -> ZoneResult<()>;
}

/// Effective-permission queries. Naive and indexed evaluation answer through
/// the same contract so their results can be cross-checked.
#[async_trait]
pub trait GraphQueryClient: Send + Sync {
    /// Whether `edge.to` is reachable from `edge.from` through at least one edge.
    async fn reaches(&self, zone: &ZoneId, edge: &EdgeId) -> ZoneResult<bool>;

    /// Vertices contributing to the effective permissions of `of`, sorted.
    async fn members(&self, zone: &ZoneId, of: &VertexId) -> ZoneResult<Vec<VertexId>>;

    async fn effective_permissions(&self, zone: &ZoneId, edge: &EdgeId)
        -> ZoneResult<Permissions>;
}

/// The two interchangeable evaluation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStrategy {
    /// Live traversal.
    Naive,
    /// Materialized effective vertices.
    Indexed,
}

impl QueryStrategy {
    pub const ALL: [QueryStrategy; 2] = [QueryStrategy::Naive, QueryStrategy::Indexed];

    pub fn path_prefix(self) -> &'static str {
        match self {
            Self::Naive => "naive",
            Self::Indexed => "indexed",
        }
    }
}

impl fmt::Display for QueryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_prefix())
    }
}

impl FromStr for QueryStrategy {
    type Err = ZoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "naive" => Ok(Self::Naive),
            "indexed" => Ok(Self::Indexed),
            other => Err(ZoneError::InvalidInput(format!(
                "unknown query strategy {other:?}"
            ))),
        }
    }
}
