//! Domain types for the zone-partitioned permission graph.

use crate::error::ZoneError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A partition of the graph owning a subset of vertices and edges.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ZoneId(String);

impl ZoneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ZoneId {
    type Err = ZoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.contains(':') {
            return Err(ZoneError::InvalidInput(format!("invalid zone id {s:?}")));
        }
        Ok(Self::new(s))
    }
}

impl TryFrom<String> for ZoneId {
    type Error = ZoneError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ZoneId> for String {
    fn from(id: ZoneId) -> Self {
        id.0
    }
}

/// A vertex, globally unique as `(owner, name)`.
///
/// Textual form is `"<zone>:<name>"`, split at the first colon so names may
/// themselves contain colons.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VertexId {
    owner: ZoneId,
    name: String,
}

impl VertexId {
    pub fn new(owner: ZoneId, name: impl Into<String>) -> Self {
        Self {
            owner,
            name: name.into(),
        }
    }

    pub fn owner(&self) -> &ZoneId {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.name)
    }
}

impl FromStr for VertexId {
    type Err = ZoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((zone, name)) if !zone.is_empty() && !name.is_empty() => {
                Ok(Self::new(ZoneId::new(zone), name))
            }
            _ => Err(ZoneError::InvalidInput(format!(
                "vertex id must be <zone>:<name>, got {s:?}"
            ))),
        }
    }
}

impl TryFrom<String> for VertexId {
    type Error = ZoneError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VertexId> for String {
    fn from(id: VertexId) -> Self {
        id.to_string()
    }
}

/// A directed `from -> to` pair. Unique per zone edge set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId {
    pub from: VertexId,
    pub to: VertexId,
}

impl EdgeId {
    pub fn new(from: VertexId, to: VertexId) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// A set of up to 32 rights.
///
/// `combine` is a bitwise union, so it is associative, commutative and
/// idempotent with [`Permissions::NONE`] as identity. The textual form is a
/// binary string, most significant right first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permissions(u32);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn combine(self, other: Permissions) -> Permissions {
        Permissions(self.0 | other.0)
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Folds any number of permission sets starting from `NONE`.
    pub fn combine_all<I: IntoIterator<Item = Permissions>>(perms: I) -> Permissions {
        perms.into_iter().fold(Self::NONE, Self::combine)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:b}", self.0)
    }
}

impl FromStr for Permissions {
    type Err = ZoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.len() > 32 || !s.bytes().all(|b| b == b'0' || b == b'1') {
            return Err(ZoneError::InvalidInput(format!(
                "permissions must be 1-32 binary digits, got {s:?}"
            )));
        }
        u32::from_str_radix(s, 2)
            .map(Self)
            .map_err(|e| ZoneError::InvalidInput(e.to_string()))
    }
}

impl TryFrom<String> for Permissions {
    type Error = ZoneError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Permissions> for String {
    fn from(p: Permissions) -> Self {
        p.to_string()
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// The permission granted when traversing `src -> dst`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub permissions: Permissions,
}

impl Edge {
    pub fn new(from: VertexId, to: VertexId, permissions: Permissions) -> Self {
        Self {
            id: EdgeId::new(from, to),
            permissions,
        }
    }

    pub fn src(&self) -> &VertexId {
        &self.id.from
    }

    pub fn dst(&self) -> &VertexId {
        &self.id.to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VertexType {
    User,
    Group,
    Space,
    Provider,
}

impl fmt::Display for VertexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Space => "space",
            Self::Provider => "provider",
        };
        f.write_str(s)
    }
}

impl FromStr for VertexType {
    type Err = ZoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "group" => Ok(Self::Group),
            "space" => Ok(Self::Space),
            "provider" => Ok(Self::Provider),
            _ => Err(ZoneError::InvalidInput(format!("unknown vertex type {s:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// `sender` feeds the target; `effective_vertices` is the complete set of
    /// vertices known to reach `sender`.
    ChildChange,
    /// `sender` no longer feeds the target.
    Detach,
}

/// Domain event delivered to the zone owning the target vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub trace: String,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub sender: VertexId,
    pub original_sender: VertexId,
    #[serde(default)]
    pub effective_vertices: BTreeSet<VertexId>,
    /// Zones each effective vertex was derived through, origin first. A
    /// vertex without an entry was derived by the sender's zone alone.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routes: BTreeMap<VertexId, Vec<ZoneId>>,
}

impl Event {
    /// Route of every effective vertex, filling in the sender's zone where
    /// none was given.
    pub fn reach(&self) -> BTreeMap<VertexId, Vec<ZoneId>> {
        self.effective_vertices
            .iter()
            .map(|v| {
                let route = self
                    .routes
                    .get(v)
                    .cloned()
                    .unwrap_or_else(|| vec![self.sender.owner().clone()]);
                (v.clone(), route)
            })
            .collect()
    }
}

/// Per-zone counters describing processed event volume.
///
/// `processing` and `queued` are gauges; `outbox` counts events sent to other
/// zones and `total` counts events fully processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub processing: u64,
    pub queued: u64,
    pub outbox: u64,
    pub total: u64,
}

impl EventStats {
    /// Sums counters, e.g. across all zones of a cluster.
    pub fn merge(&mut self, other: &EventStats) {
        self.processing += other.processing;
        self.queued += other.queued;
        self.outbox += other.outbox;
        self.total += other.total;
    }
}

/// Zones that must be notified when a zone's graph changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentZonesDto {
    pub zones: BTreeSet<ZoneId>,
}

impl DependentZonesDto {
    pub fn new(zones: impl IntoIterator<Item = ZoneId>) -> Self {
        Self {
            zones: zones.into_iter().collect(),
        }
    }
}
