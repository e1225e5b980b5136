//! Flattening of nested feed messages into row-level records.
//!
//! One `TripUpdate` entity yields one record per stop-time update; one
//! `VehiclePosition` entity yields exactly one record. The pass is lazy
//! and side-effect free, so flattening the same message twice yields the
//! identical sequence.

use chrono::DateTime;

use crate::model::{Entity, FeedMessage, FlatRecord, TripDescriptor};

/// Formats epoch seconds as UTC "YYYY-MM-DD HH:MM:SS".
///
/// Out-of-range values yield `None`; callers leave the field unset
/// instead of failing the record.
pub fn format_utc(epoch_secs: i64) -> Option<String> {
    DateTime::from_timestamp(epoch_secs, 0).map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Flattens one feed message into per-stop records.
pub fn flatten(msg: &FeedMessage) -> impl Iterator<Item = FlatRecord> + '_ {
    let feed_header_timestamp = msg.header.timestamp.and_then(format_utc);
    let unique_event_id = msg.unique_event_id.clone();

    msg.entity.iter().flat_map(move |entity| {
        flatten_entity(entity, &unique_event_id, &feed_header_timestamp)
    })
}

fn flatten_entity(
    entity: &Entity,
    unique_event_id: &Option<String>,
    feed_header_timestamp: &Option<String>,
) -> Vec<FlatRecord> {
    let base = FlatRecord {
        unique_event_id: unique_event_id.clone(),
        feed_header_timestamp: feed_header_timestamp.clone(),
        entity_id: entity.id.clone(),
        ..FlatRecord::default()
    };

    if let Some(tu) = &entity.trip_update {
        let base = with_trip(base, tu.trip.as_ref());
        tu.stop_time_update
            .iter()
            .map(|stu| FlatRecord {
                stop_id: stu.stop_id.clone(),
                ..base.clone()
            })
            .collect()
    } else if let Some(v) = &entity.vehicle {
        let base = with_trip(base, v.trip.as_ref());
        vec![FlatRecord {
            stop_id: v.stop_id.clone(),
            current_status: v.current_status.clone(),
            current_stop_sequence: v.current_stop_sequence,
            // Parsed independently of the header: a bad vehicle timestamp
            // only blanks this one field.
            vehicle_timestamp: v.timestamp.and_then(format_utc),
            ..base
        }]
    } else {
        Vec::new()
    }
}

fn with_trip(mut record: FlatRecord, trip: Option<&TripDescriptor>) -> FlatRecord {
    if let Some(trip) = trip {
        record.trip_id = trip.trip_id.clone();
        record.start_time = trip.start_time.clone();
        record.start_date = trip.start_date.clone();
        record.route_id = trip.route_id.clone();
    }
    record
}
