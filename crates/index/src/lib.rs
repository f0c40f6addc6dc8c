//! Effective-permission engine, zone graph, materialized index, local zones
//! and the notification pipeline.

pub mod cluster;
pub mod effective;
pub mod graph;
pub mod index;
pub mod instrumentation;
pub mod naive;
pub mod zone;

pub use cluster::{ClusterQuery, LocalCluster};
pub use effective::{EffectiveVertex, ModificationObserver, RecalculationResult, VertexModification};
pub use graph::Graph;
pub use index::{Feeds, Reach, ReindexSummary, Route, ZoneIndex};
pub use instrumentation::{
    Instrumentation, InstrumentationConfig, JsonStreamSink, MemorySink, Notification,
    NotificationKind, NotificationSink,
};
pub use zone::{LocalQuery, LocalZone, Mutation, ZoneLink};
