//! Pipeline delivery counters.
//!
//! Shared across the driver and the sink writer via `Arc`; every field is
//! an atomic so shard workers never contend on a lock for bookkeeping.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub messages_received: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub records_flattened: AtomicU64,
    pub records_filtered: AtomicU64,
    pub late_drops: AtomicU64,
    pub panes_released: AtomicU64,
    pub rows_written: AtomicU64,
    pub sink_retries: AtomicU64,
}

/// Plain-value copy of the counters, for logging and assertions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub malformed_messages: u64,
    pub records_flattened: u64,
    pub records_filtered: u64,
    pub late_drops: u64,
    pub panes_released: u64,
    pub rows_written: u64,
    pub sink_retries: u64,
}

impl PipelineStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    /// Late drops are owned by the window engine; the driver mirrors the
    /// engine's count here after each insert/poll round.
    pub fn set_late_drops(&self, n: u64) {
        self.late_drops.store(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            records_flattened: self.records_flattened.load(Ordering::Relaxed),
            records_filtered: self.records_filtered.load(Ordering::Relaxed),
            late_drops: self.late_drops.load(Ordering::Relaxed),
            panes_released: self.panes_released.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            sink_retries: self.sink_retries.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self, shard: usize) {
        let s = self.snapshot();
        info!(
            shard,
            messages_received = s.messages_received,
            malformed_messages = s.malformed_messages,
            records_flattened = s.records_flattened,
            records_filtered = s.records_filtered,
            late_drops = s.late_drops,
            panes_released = s.panes_released,
            rows_written = s.rows_written,
            sink_retries = s.sink_retries,
            "Pipeline summary"
        );
    }
}
