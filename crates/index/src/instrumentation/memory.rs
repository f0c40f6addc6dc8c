//! In-memory sink, mostly for tests and the replay command.

use super::{Notification, NotificationSink};
use std::sync::{Arc, Mutex, PoisonError};
use zonegraph_core::ZoneResult;

/// Collects every delivered notification. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<Notification>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far, in delivery order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NotificationSink for MemorySink {
    fn handle(&mut self, bulk: &[Notification]) -> ZoneResult<()> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bulk);
        Ok(())
    }
}
