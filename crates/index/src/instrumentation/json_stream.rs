//! NDJSON (newline-delimited JSON) notification sink.
//!
//! Each notification is serialized directly to the writer without an
//! intermediate `String`.
//!
//! ```ignore
//! let sink = JsonStreamSink::create("report.ndjson")?;
//! let (instrumentation, worker) = Instrumentation::new(&config, sink);
//! ```

use super::{Notification, NotificationSink};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use zonegraph_core::{ZoneError, ZoneResult};

/// Buffered NDJSON writer, flushed once per bulk.
pub struct JsonStreamSink<W: Write> {
    writer: BufWriter<W>,
    rows_written: usize,
}

impl JsonStreamSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl JsonStreamSink<File> {
    /// Truncates or creates the report file.
    pub fn create(path: impl AsRef<Path>) -> ZoneResult<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .map_err(|e| ZoneError::Sink(format!("Failed to create {}: {e}", path.display())))?;
        Ok(Self::new(file))
    }
}

impl<W: Write> JsonStreamSink<W> {
    /// Wraps any writer (file, `Vec<u8>`, etc.).
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(64 * 1024, writer),
            rows_written: 0,
        }
    }

    pub fn write_notification(&mut self, row: &Notification) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, row).map_err(io::Error::other)?;
        self.writer.write_all(b"\n")?;
        self.rows_written += 1;
        Ok(())
    }

    /// Number of rows written so far.
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write + Send + 'static> NotificationSink for JsonStreamSink<W> {
    fn handle(&mut self, bulk: &[Notification]) -> ZoneResult<()> {
        for row in bulk {
            self.write_notification(row)?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> ZoneResult<()> {
        self.writer.flush()?;
        tracing::debug!(rows = self.rows_written, "ndjson sink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::NotificationKind;
    use zonegraph_core::ZoneId;

    #[test]
    fn one_line_per_notification() {
        let mut sink = JsonStreamSink::new(Vec::new());
        let bulk: Vec<Notification> = ["t1", "t2"]
            .into_iter()
            .map(|trace| {
                Notification::now(
                    ZoneId::new("a"),
                    trace,
                    "a:g1".parse().unwrap(),
                    NotificationKind::StartProcessing,
                )
            })
            .collect();

        sink.handle(&bulk).unwrap();
        assert_eq!(sink.rows_written(), 2);

        let output = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = output.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);

        let first: Notification = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, bulk[0]);
    }
}
