//! Pipeline driver: the continuous consume-flatten-window-enrich-sink loop.
//!
//! Acknowledgment ordering is the at-least-once contract: a message is
//! acked to the bus only after its records are buffered in the window
//! engine, never gated on the final sink write. A crash between pane
//! release and sink acknowledgment can therefore redeliver rows; a
//! malformed envelope is never acked, leaving redelivery or
//! dead-lettering to the bus.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{BusConsumer, BusMessage};
use crate::enrich::enrich;
use crate::flatten::flatten;
use crate::model::FeedMessage;
use crate::sink::{Sink, SinkWriter};
use crate::stats::PipelineStats;
use crate::stops::StopTable;
use crate::window::{Pane, WindowEngine};

pub struct Pipeline<S: Sink> {
    shard: usize,
    stops: Arc<StopTable>,
    engine: WindowEngine,
    writer: SinkWriter<S>,
    stats: Arc<PipelineStats>,
    flush_on_shutdown: bool,
    /// Poll cadence for trigger evaluation when no messages arrive.
    tick: Duration,
}

impl<S: Sink> Pipeline<S> {
    pub fn new(
        shard: usize,
        stops: Arc<StopTable>,
        engine: WindowEngine,
        writer: SinkWriter<S>,
        stats: Arc<PipelineStats>,
        flush_on_shutdown: bool,
    ) -> Self {
        Self {
            shard,
            stops,
            engine,
            writer,
            stats,
            flush_on_shutdown,
            tick: Duration::from_millis(500),
        }
    }

    /// Runs the shard loop until the bus closes or shutdown is signaled.
    ///
    /// Returns an error only for unrecoverable sink failures; bad
    /// messages and bad records never stop the loop.
    pub async fn run<C: BusConsumer>(
        &mut self,
        bus: &mut C,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(shard = self.shard, "Pipeline shard started");
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(shard = self.shard, "Shutdown signal received");
                    break;
                }
                _ = ticker.tick() => {
                    let panes = self.engine.poll(now_ms());
                    self.deliver(panes).await?;
                }
                msg = bus.next() => {
                    let Some(msg) = msg else {
                        info!(shard = self.shard, "Bus subscription closed");
                        break;
                    };
                    self.handle_message(msg, bus).await?;
                }
            }
        }

        if self.flush_on_shutdown {
            let panes = self.engine.drain();
            if !panes.is_empty() {
                info!(shard = self.shard, panes = panes.len(), "Flushing buffered windows");
            }
            self.deliver(panes).await?;
        } else if self.engine.open_windows() > 0 {
            warn!(
                shard = self.shard,
                abandoned = self.engine.open_windows(),
                "Abandoning buffered windows on shutdown"
            );
        }

        self.stats.log_summary(self.shard);
        Ok(())
    }

    async fn handle_message<C: BusConsumer>(&mut self, msg: BusMessage, bus: &mut C) -> Result<()> {
        PipelineStats::incr(&self.stats.messages_received);

        let feed: FeedMessage = match serde_json::from_slice(&msg.payload) {
            Ok(feed) => feed,
            Err(e) => {
                // Withhold the ack: the bus redelivers or dead-letters
                // per its own policy.
                PipelineStats::incr(&self.stats.malformed_messages);
                warn!(
                    shard = self.shard,
                    message_id = msg.id,
                    error = %e,
                    "Malformed message envelope, withholding ack"
                );
                return Ok(());
            }
        };

        let event_ts = feed
            .event_timestamp_unix
            .or(feed.header.timestamp)
            .unwrap_or_else(|| Utc::now().timestamp());
        let now = now_ms();

        let mut flattened = 0u64;
        let mut filtered = 0u64;
        let mut panes = Vec::new();
        for record in flatten(&feed) {
            flattened += 1;
            // Records with no operational status are not forwarded.
            if record.current_status.is_none() {
                filtered += 1;
                continue;
            }
            panes.extend(self.engine.insert(record, event_ts, now));
        }
        PipelineStats::add(&self.stats.records_flattened, flattened);
        PipelineStats::add(&self.stats.records_filtered, filtered);

        // Records are safely buffered (or filtered): ack now, before any
        // sink write happens.
        bus.ack(&msg).await;
        debug!(
            shard = self.shard,
            message_id = msg.id,
            flattened,
            filtered,
            "Message buffered and acked"
        );

        self.deliver(panes).await
    }

    /// Enriches and writes released panes. Sink retry exhaustion
    /// propagates: those records are lost unless the bus still redelivers
    /// the originating messages.
    async fn deliver(&mut self, panes: Vec<Pane>) -> Result<()> {
        for pane in panes {
            let rows: Vec<_> = pane
                .records
                .into_iter()
                .map(|r| enrich(r, &self.stops))
                .collect();

            self.writer.write_pane(&rows).await?;

            PipelineStats::incr(&self.stats.panes_released);
            PipelineStats::add(&self.stats.rows_written, rows.len() as u64);
            debug!(
                shard = self.shard,
                slice_start = pane.slice_start,
                rows = rows.len(),
                "Pane delivered to sink"
            );
        }
        self.stats.set_late_drops(self.engine.late_drops());
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::channel_bus;
    use crate::sink::CsvTableSink;
    use crate::stops::{StopInfo, StopTable};
    use crate::window::WindowConfig;

    fn test_pipeline(path: &std::path::Path, window: WindowConfig) -> Pipeline<CsvTableSink> {
        let stats = Arc::new(PipelineStats::default());
        let stops = Arc::new(StopTable::from_stops(vec![StopInfo {
            stop_id: "A01".to_string(),
            stop_name: Some("Inwood - 207 St".to_string()),
            stop_lat: Some(40.868_072),
            stop_lon: Some(-73.919_899),
        }]));
        let writer = SinkWriter::new(
            CsvTableSink::new(path),
            1,
            Duration::from_millis(1),
            stats.clone(),
        );
        Pipeline::new(0, stops, WindowEngine::new(window), writer, stats, true)
    }

    fn envelope(entities: &str) -> Vec<u8> {
        format!(
            r#"{{
                "header": {{"gtfs_realtime_version": "2.0", "timestamp": 1700000000}},
                "entity": [{entities}],
                "unique_event_id": "1700000000-7",
                "event_timestamp_unix": 1700000000
            }}"#
        )
        .into_bytes()
    }

    fn vehicle_entity(id: &str, stop_id: &str) -> String {
        format!(
            r#"{{"id": "{id}", "vehicle": {{
                "trip": {{"trip_id": "t1", "route_id": "A"}},
                "stop_id": "{stop_id}",
                "current_status": "STOPPED_AT",
                "current_stop_sequence": 3,
                "timestamp": 1700000005
            }}}}"#
        )
    }

    #[tokio::test]
    async fn test_ack_follows_buffering_and_precedes_sink() {
        let path = std::env::temp_dir().join("gtfs_rt_enricher_pipeline_ack.csv");
        let _ = std::fs::remove_file(&path);

        // No early triggers at all: records stay buffered, nothing is
        // written, yet the message must still be acked.
        let window = WindowConfig {
            slice: Duration::from_secs(3600),
            early_quantum: None,
            count_threshold: None,
            fire_on_first: false,
            allowed_lateness: Duration::from_secs(10),
        };
        let mut pipeline = test_pipeline(&path, window);

        let (publisher, mut bus) = channel_bus(4);
        let ack_log = bus.ack_log();
        let id = publisher
            .publish(envelope(&vehicle_entity("e1", "A01N")))
            .await
            .unwrap();
        let msg = bus.next().await.unwrap();

        pipeline.handle_message(msg, &mut bus).await.unwrap();

        assert_eq!(*ack_log.lock().unwrap(), vec![id]);
        assert!(!path.exists(), "no pane should have been written yet");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_not_acked() {
        let path = std::env::temp_dir().join("gtfs_rt_enricher_pipeline_malformed.csv");
        let _ = std::fs::remove_file(&path);
        let mut pipeline = test_pipeline(&path, WindowConfig::default());

        let (publisher, mut bus) = channel_bus(4);
        let ack_log = bus.ack_log();
        publisher.publish(b"not json at all".to_vec()).await.unwrap();
        let msg = bus.next().await.unwrap();

        pipeline.handle_message(msg, &mut bus).await.unwrap();

        assert!(ack_log.lock().unwrap().is_empty());
        assert_eq!(pipeline.stats.snapshot().malformed_messages, 1);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_filter_drops_statusless_records() {
        let path = std::env::temp_dir().join("gtfs_rt_enricher_pipeline_filter.csv");
        let _ = std::fs::remove_file(&path);
        let mut pipeline = test_pipeline(&path, WindowConfig::default());

        let trip_entity = r#"{"id": "e1", "trip_update": {
            "trip": {"trip_id": "t1", "route_id": "A"},
            "stop_time_update": [{"stop_id": "A01N"}, {"stop_id": "A01S"}]
        }}"#;
        let entities = format!("{},{}", trip_entity, vehicle_entity("e2", "A01S"));

        let (publisher, mut bus) = channel_bus(4);
        publisher.publish(envelope(&entities)).await.unwrap();
        let msg = bus.next().await.unwrap();

        pipeline.handle_message(msg, &mut bus).await.unwrap();

        let s = pipeline.stats.snapshot();
        assert_eq!(s.records_flattened, 3);
        assert_eq!(s.records_filtered, 2);

        // Default config fires on first record: the vehicle row is
        // already enriched and written.
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2); // header + 1 row
        assert!(content.contains("Southbound"));
        assert!(content.contains("Inwood - 207 St"));

        let _ = std::fs::remove_file(&path);
    }
}
