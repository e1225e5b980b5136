//! Analytical sink: append-only writes of released panes.
//!
//! The [`Sink`] trait is the seam to the analytical store; [`CsvTableSink`]
//! appends rows to a local CSV table. [`SinkWriter`] wraps any sink with
//! bounded retries. Delivery is at least once: a crash between pane
//! release and sink acknowledgment may redeliver a pane, so downstream
//! consumers needing exactly-once must dedup on
//! (unique_event_id, entity_id, stop_id).

use anyhow::{Context, Result};
use async_trait::async_trait;
use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::model::FlatRecord;
use crate::stats::PipelineStats;

#[async_trait]
pub trait Sink: Send + Sync {
    /// Appends one pane of enriched records. Never mutates or deletes
    /// prior rows.
    async fn append(&self, records: &[FlatRecord]) -> Result<()>;
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Arc<S> {
    async fn append(&self, records: &[FlatRecord]) -> Result<()> {
        (**self).append(records).await
    }
}

/// CSV-backed table with append semantics. The header row is written only
/// when the file is first created; a lock serializes appends so shards
/// sharing one table never interleave rows.
pub struct CsvTableSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvTableSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn append_rows(&self, records: &[FlatRecord]) -> Result<()> {
        let _guard = self.write_lock.lock().expect("sink lock poisoned");

        let file_exists = Path::new(&self.path).exists();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("failed to open sink table {}", self.path.display()))?;

        let mut writer = WriterBuilder::new()
            .has_headers(!file_exists) // IMPORTANT when appending
            .from_writer(file);

        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;

        debug!(
            rows = records.len(),
            table = %self.path.display(),
            "Appended pane to sink table"
        );
        Ok(())
    }
}

#[async_trait]
impl Sink for CsvTableSink {
    async fn append(&self, records: &[FlatRecord]) -> Result<()> {
        self.append_rows(records)
    }
}

/// Retrying front-end for a sink. Exhausting the retry budget surfaces
/// the error to the driver; that pane's records are not considered
/// delivered.
pub struct SinkWriter<S: Sink> {
    sink: S,
    max_retries: u32,
    backoff: Duration,
    stats: Arc<PipelineStats>,
}

impl<S: Sink> SinkWriter<S> {
    pub fn new(sink: S, max_retries: u32, backoff: Duration, stats: Arc<PipelineStats>) -> Self {
        Self {
            sink,
            max_retries,
            backoff,
            stats,
        }
    }

    pub async fn write_pane(&self, records: &[FlatRecord]) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.sink.append(records).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    PipelineStats::incr(&self.stats.sink_retries);
                    warn!(attempt, max = self.max_retries, error = %e, "Sink write failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("sink write failed after {attempt} retries, pane lost")
                    });
                }
            }
        }
    }
}
