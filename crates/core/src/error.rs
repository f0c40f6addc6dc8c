//! Centralized error types for the zonegraph workspace.

use crate::types::ZoneId;
use thiserror::Error;

/// Top-level error enum. Variants map to subsystems.
///
/// Staleness is deliberately absent: an incomplete recalculation is reported
/// through the `dirty` flag of an effective vertex, never as an error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ZoneError {
    /// A zone answered outside the 2xx range.
    #[error("RPC failed with status {status}: {url}")]
    Rpc { status: u16, url: String },

    /// The zone could not be reached, or the response could not be read.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The notification queue is full.
    #[error("Overload: {0}")]
    Overload(String),

    #[error("Unknown zone: {0}")]
    UnknownZone(ZoneId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ZoneError {
    /// HTTP status carried by an [`ZoneError::Rpc`] failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rpc { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_overload(&self) -> bool {
        matches!(self, Self::Overload(_))
    }
}

impl From<std::io::Error> for ZoneError {
    fn from(e: std::io::Error) -> Self {
        Self::Sink(e.to_string())
    }
}

pub type ZoneResult<T> = Result<T, ZoneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_for_rpc_failures() {
        let err = ZoneError::Rpc {
            status: 503,
            url: "http://z1/graph/edges".into(),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(ZoneError::Transport("refused".into()).status(), None);
    }

    #[test]
    fn display_mentions_zone() {
        let err = ZoneError::UnknownZone(ZoneId::new("eu"));
        assert_eq!(err.to_string(), "Unknown zone: eu");
    }
}
