//! Wire and row data model for the enrichment pipeline.
//!
//! [`FeedMessage`] mirrors the JSON envelope the upstream fetcher publishes
//! to the bus (proto-JSON field names, plus the injected `unique_event_id`
//! and `event_timestamp_unix`). [`FlatRecord`] is the fixed 15-column row
//! shape written to the analytical sink.

use serde::{Deserialize, Deserializer, Serialize};

/// One feed snapshot as consumed from the message bus.
///
/// Proto-JSON renders 64-bit integers as strings, so timestamp and
/// sequence fields accept either form; an unparsable value leaves the
/// field unset rather than failing the envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedMessage {
    pub header: FeedHeader,
    pub entity: Vec<Entity>,
    pub unique_event_id: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub event_timestamp_unix: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeedHeader {
    pub gtfs_realtime_version: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub timestamp: Option<i64>,
}

/// One update unit within a feed. Carries at most one honored variant;
/// `trip_update` takes precedence when both are present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Entity {
    pub id: Option<String>,
    pub trip_update: Option<TripUpdate>,
    pub vehicle: Option<VehiclePosition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TripUpdate {
    pub trip: Option<TripDescriptor>,
    pub stop_time_update: Vec<StopTimeUpdate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StopTimeUpdate {
    pub stop_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VehiclePosition {
    pub trip: Option<TripDescriptor>,
    pub stop_id: Option<String>,
    pub current_status: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub current_stop_sequence: Option<i64>,
    #[serde(deserialize_with = "lenient_i64")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TripDescriptor {
    pub trip_id: Option<String>,
    pub start_time: Option<String>,
    pub start_date: Option<String>,
    pub route_id: Option<String>,
}

/// One row of the sink table. Every record carries all 15 fields; absent
/// values serialize as nulls or empty cells, never as missing columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatRecord {
    pub unique_event_id: Option<String>,
    pub feed_header_timestamp: Option<String>,
    pub entity_id: Option<String>,
    pub trip_id: Option<String>,
    pub start_time: Option<String>,
    pub start_date: Option<String>,
    pub route_id: Option<String>,
    pub stop_id: Option<String>,
    pub vehicle_timestamp: Option<String>,
    pub current_status: Option<String>,
    pub current_stop_sequence: Option<i64>,
    pub stop_name: Option<String>,
    pub stop_lat: Option<f64>,
    pub stop_lon: Option<f64>,
    pub direction: Option<String>,
}

/// Accepts a JSON integer, float (truncated), or decimal string; any
/// other value becomes `None` without failing the envelope.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Number(n)) => {
            n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))
        }
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
