//! Permission model, identifiers, shared DTOs, and error definitions.
//!
//! Foundation crate -- no async or I/O dependencies.

pub mod error;
pub mod types;

pub use error::{ZoneError, ZoneResult};
pub use types::{
    DependentZonesDto, Edge, EdgeId, Event, EventStats, EventType, Permissions, VertexId,
    VertexType, ZoneId,
};
