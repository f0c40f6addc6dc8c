//! Bounded, asynchronous notification pipeline.
//!
//! Producers enqueue without blocking; a single dedicated consumer thread
//! drains the queue in bulks of at most [`BULK_SIZE`] and hands each bulk to a
//! [`NotificationSink`] in one call.
//!
//! A full queue is an error for the producer ([`ZoneError::Overload`]), so a
//! sink that cannot keep up is loud instead of silently lossy. A disabled
//! pipeline accepts and discards everything.
//!
//! ```ignore
//! let (instrumentation, worker) = Instrumentation::new(&config, JsonStreamSink::create(path)?);
//! let handle = worker.spawn()?;
//! instrumentation.notify(notification)?;
//! let delivered = handle.stop().await?;
//! ```

pub mod json_stream;
pub mod memory;

use crate::effective::RecalculationResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::SystemTime;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use zonegraph_core::{VertexId, ZoneError, ZoneId, ZoneResult};

pub use json_stream::JsonStreamSink;
pub use memory::MemorySink;

/// Largest batch handed to the sink at once.
pub const BULK_SIZE: usize = 500;

/// Queue bound.
pub const QUEUE_CAPACITY: usize = 5 * BULK_SIZE;

#[derive(Debug, Clone, Default)]
pub struct InstrumentationConfig {
    pub enabled: bool,
    /// Where file-backed sinks write. `None` means stdout.
    pub report_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    Queued,
    StartProcessing,
    EndProcessing,
    Forwarded,
    Recalculated { result: RecalculationResult },
    Fail,
}

/// One system event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Milliseconds since the Unix epoch.
    pub time_ms: u64,
    pub zone: ZoneId,
    pub trace: String,
    pub vertex: VertexId,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn now(zone: ZoneId, trace: impl Into<String>, vertex: VertexId, kind: NotificationKind) -> Self {
        let time_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            time_ms,
            zone,
            trace: trace.into(),
            vertex,
            kind,
        }
    }
}

/// Persistent destination for notification bulks.
pub trait NotificationSink: Send + 'static {
    fn open(&mut self) -> ZoneResult<()> {
        Ok(())
    }

    /// Receives notifications in enqueue order.
    fn handle(&mut self, bulk: &[Notification]) -> ZoneResult<()>;

    fn close(&mut self) -> ZoneResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

enum Message {
    Notify(Notification),
    Shutdown,
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct Instrumentation {
    tx: Option<mpsc::Sender<Message>>,
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumentation")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Instrumentation {
    /// A pipeline that discards every notification.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Creates the queue. Nothing is consumed until the worker is spawned.
    pub fn new<S: NotificationSink>(
        config: &InstrumentationConfig,
        sink: S,
    ) -> (Self, NotificationWorker<S>) {
        if !config.enabled {
            tracing::info!("instrumentation disabled");
            return (
                Self::disabled(),
                NotificationWorker {
                    rx: None,
                    tx: None,
                    sink,
                },
            );
        }

        tracing::info!(
            report = ?config.report_path,
            capacity = QUEUE_CAPACITY,
            "instrumentation enabled"
        );
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (
            Self { tx: Some(tx.clone()) },
            NotificationWorker {
                rx: Some(rx),
                tx: Some(tx),
                sink,
            },
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Enqueues without blocking.
    ///
    /// Fails with [`ZoneError::Overload`] when the queue is full.
    pub fn notify(&self, notification: Notification) -> ZoneResult<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };

        match tx.try_send(Message::Notify(notification)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let message = "Can't keep up with notifications!";
                tracing::error!(capacity = QUEUE_CAPACITY, "{message}");
                Err(ZoneError::Overload(message.into()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(ZoneError::Internal("instrumentation worker has stopped".into()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// Owns the queue receiver and the sink until spawned.
pub struct NotificationWorker<S> {
    rx: Option<mpsc::Receiver<Message>>,
    tx: Option<mpsc::Sender<Message>>,
    sink: S,
}

impl<S: NotificationSink> NotificationWorker<S> {
    /// Starts the consumer thread.
    pub fn spawn(self) -> ZoneResult<WorkerHandle> {
        let Some(rx) = self.rx else {
            return Ok(WorkerHandle {
                tx: None,
                thread: None,
            });
        };

        let sink = self.sink;
        let thread = std::thread::Builder::new()
            .name("instrumentation".into())
            .spawn(move || run(rx, sink))
            .map_err(|e| ZoneError::Internal(format!("Failed to spawn instrumentation thread: {e}")))?;

        Ok(WorkerHandle {
            tx: self.tx,
            thread: Some(thread),
        })
    }
}

/// Running consumer. [`WorkerHandle::stop`] shuts it down cooperatively.
pub struct WorkerHandle {
    tx: Option<mpsc::Sender<Message>>,
    thread: Option<JoinHandle<ZoneResult<usize>>>,
}

impl WorkerHandle {
    /// Flushes everything enqueued before the call, closes the sink and
    /// returns how many notifications were delivered.
    pub async fn stop(mut self) -> ZoneResult<usize> {
        if let Some(tx) = self.tx.take() {
            // Waits for capacity; a closed queue means the worker already exited.
            let _ = tx.send(Message::Shutdown).await;
        }

        let Some(thread) = self.thread.take() else {
            return Ok(0);
        };

        tokio::task::spawn_blocking(move || thread.join())
            .await
            .map_err(|e| ZoneError::Internal(format!("join failed: {e}")))?
            .map_err(|_| ZoneError::Internal("instrumentation thread panicked".into()))?
    }
}

fn run<S: NotificationSink>(mut rx: mpsc::Receiver<Message>, mut sink: S) -> ZoneResult<usize> {
    sink.open()?;

    let mut delivered = 0usize;
    let mut bulk = Vec::with_capacity(BULK_SIZE);
    let mut shutdown = false;

    while !shutdown {
        match rx.blocking_recv() {
            Some(Message::Notify(n)) => bulk.push(n),
            Some(Message::Shutdown) | None => shutdown = true,
        }

        while !shutdown && !bulk.is_empty() && bulk.len() < BULK_SIZE {
            match rx.try_recv() {
                Ok(Message::Notify(n)) => bulk.push(n),
                Ok(Message::Shutdown) | Err(TryRecvError::Disconnected) => shutdown = true,
                Err(TryRecvError::Empty) => break,
            }
        }

        if !bulk.is_empty() {
            if let Err(e) = sink.handle(&bulk) {
                tracing::error!(error = %e, size = bulk.len(), "notification sink failed");
                return Err(e);
            }
            delivered += bulk.len();
            bulk.clear();
        }
    }

    sink.close()?;
    tracing::info!(delivered, "instrumentation worker stopped");
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records the size of every bulk it receives.
    #[derive(Clone, Default)]
    struct BulkRecorder {
        bulks: Arc<Mutex<Vec<usize>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl NotificationSink for BulkRecorder {
        fn handle(&mut self, bulk: &[Notification]) -> ZoneResult<()> {
            self.bulks.lock().unwrap().push(bulk.len());
            Ok(())
        }

        fn close(&mut self) -> ZoneResult<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn enabled() -> InstrumentationConfig {
        InstrumentationConfig {
            enabled: true,
            report_path: None,
        }
    }

    fn notification(i: usize) -> Notification {
        Notification::now(
            ZoneId::new("a"),
            format!("t{i}"),
            "a:v".parse().unwrap(),
            NotificationKind::Queued,
        )
    }

    #[test]
    fn full_queue_overloads() {
        let (instrumentation, _worker) = Instrumentation::new(&enabled(), BulkRecorder::default());

        for i in 0..QUEUE_CAPACITY {
            instrumentation.notify(notification(i)).unwrap();
        }
        let err = instrumentation.notify(notification(QUEUE_CAPACITY)).unwrap_err();
        assert!(err.is_overload());
    }

    #[tokio::test]
    async fn drains_in_bulks_of_at_most_bulk_size() {
        let sink = BulkRecorder::default();
        let (instrumentation, worker) = Instrumentation::new(&enabled(), sink.clone());

        for i in 0..1200 {
            instrumentation.notify(notification(i)).unwrap();
        }
        let handle = worker.spawn().unwrap();
        let delivered = handle.stop().await.unwrap();

        assert_eq!(delivered, 1200);
        assert_eq!(*sink.bulks.lock().unwrap(), vec![500, 500, 200]);
        assert!(*sink.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn disabled_pipeline_is_a_no_op() {
        let sink = BulkRecorder::default();
        let config = InstrumentationConfig::default();
        let (instrumentation, worker) = Instrumentation::new(&config, sink.clone());

        for i in 0..QUEUE_CAPACITY + 10 {
            instrumentation.notify(notification(i)).unwrap();
        }
        assert!(!instrumentation.is_enabled());
        assert_eq!(worker.spawn().unwrap().stop().await.unwrap(), 0);
        assert!(sink.bulks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn notify_after_stop_fails() {
        let (instrumentation, worker) = Instrumentation::new(&enabled(), BulkRecorder::default());
        worker.spawn().unwrap().stop().await.unwrap();

        assert!(instrumentation.notify(notification(0)).is_err());
    }

    #[test]
    fn notification_wire_format() {
        let n = Notification::now(
            ZoneId::new("a"),
            "t1",
            "a:v".parse().unwrap(),
            NotificationKind::Recalculated {
                result: RecalculationResult::Cleaned,
            },
        );
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["kind"]["type"], "recalculated");
        assert_eq!(json["kind"]["result"], "CLEANED");
        assert_eq!(json["vertex"], "a:v");
    }
}
