//! Fetches GTFS-RT protobuf snapshots and republishes them as the JSON
//! bus envelope the pipeline consumes.
//!
//! The envelope contract: proto-JSON field names, a caller-injected
//! `unique_event_id` of the form `"{feed_timestamp}-{hash_of_payload}"`
//! (a plain hash, no collision-resistance implied), and an
//! `event_timestamp_unix` equal to the feed header timestamp or the wall
//! clock when the header has none.

use anyhow::{Context, Result};
use chrono::Utc;
use prost::Message;
use serde_json::{Map, Value, json};
use std::hash::{DefaultHasher, Hash, Hasher};
use tracing::debug;

use super::http::{HttpClient, fetch_bytes};
use crate::gtfs_rt;

pub struct FeedFetcher<C: HttpClient> {
    client: C,
    url: String,
}

impl<C: HttpClient> FeedFetcher<C> {
    pub fn new(client: C, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Downloads and decodes one snapshot, returning the JSON envelope
    /// ready for publishing. HTTP failures are transient (retried by the
    /// caller's schedule); an undecodable body is an upstream defect and
    /// also surfaces as an error.
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    pub async fn fetch_envelope(&self) -> Result<Vec<u8>> {
        let bytes = fetch_bytes(&self.client, &self.url).await?;
        let feed = gtfs_rt::FeedMessage::decode(bytes.as_slice())
            .context("failed to decode GTFS-RT protobuf feed")?;
        debug!(entities = feed.entity.len(), "Feed snapshot decoded");
        envelope_from_feed(&feed)
    }
}

/// Serializes a decoded feed into the bus envelope, injecting the unique
/// event id and the event timestamp.
pub fn envelope_from_feed(feed: &gtfs_rt::FeedMessage) -> Result<Vec<u8>> {
    let feed_timestamp = feed
        .header
        .timestamp
        .map(|t| t as i64)
        .unwrap_or_else(|| Utc::now().timestamp());

    let mut envelope = Map::new();
    envelope.insert(
        "header".to_string(),
        json!({
            "gtfs_realtime_version": feed.header.gtfs_realtime_version,
            "timestamp": feed.header.timestamp,
        }),
    );
    envelope.insert(
        "entity".to_string(),
        Value::Array(feed.entity.iter().map(entity_json).collect()),
    );

    let body = serde_json::to_string(&envelope)?;
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);

    envelope.insert(
        "unique_event_id".to_string(),
        Value::from(format!("{feed_timestamp}-{}", hasher.finish())),
    );
    envelope.insert("event_timestamp_unix".to_string(), Value::from(feed_timestamp));

    Ok(serde_json::to_vec(&envelope)?)
}

fn entity_json(entity: &gtfs_rt::FeedEntity) -> Value {
    let mut out = Map::new();
    out.insert("id".to_string(), Value::from(entity.id.clone()));

    if let Some(tu) = &entity.trip_update {
        let mut trip_update = Map::new();
        trip_update.insert("trip".to_string(), trip_json(Some(&tu.trip)));
        trip_update.insert(
            "stop_time_update".to_string(),
            Value::Array(
                tu.stop_time_update
                    .iter()
                    .map(|stu| {
                        let mut m = Map::new();
                        insert_opt(&mut m, "stop_id", stu.stop_id.clone());
                        if let Some(seq) = stu.stop_sequence {
                            m.insert("stop_sequence".to_string(), Value::from(seq));
                        }
                        Value::Object(m)
                    })
                    .collect(),
            ),
        );
        out.insert("trip_update".to_string(), Value::Object(trip_update));
    } else if let Some(v) = &entity.vehicle {
        let mut vehicle = Map::new();
        if v.trip.is_some() {
            vehicle.insert("trip".to_string(), trip_json(v.trip.as_ref()));
        }
        insert_opt(&mut vehicle, "stop_id", v.stop_id.clone());
        if v.current_status.is_some() {
            vehicle.insert(
                "current_status".to_string(),
                Value::from(v.current_status().as_str_name()),
            );
        }
        if let Some(seq) = v.current_stop_sequence {
            vehicle.insert("current_stop_sequence".to_string(), Value::from(seq));
        }
        if let Some(ts) = v.timestamp {
            vehicle.insert("timestamp".to_string(), Value::from(ts));
        }
        out.insert("vehicle".to_string(), Value::Object(vehicle));
    }

    Value::Object(out)
}

fn trip_json(trip: Option<&gtfs_rt::TripDescriptor>) -> Value {
    let mut m = Map::new();
    if let Some(trip) = trip {
        insert_opt(&mut m, "trip_id", trip.trip_id.clone());
        insert_opt(&mut m, "start_time", trip.start_time.clone());
        insert_opt(&mut m, "start_date", trip.start_date.clone());
        insert_opt(&mut m, "route_id", trip.route_id.clone());
    }
    Value::Object(m)
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(value) = value {
        map.insert(key.to_string(), Value::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::vehicle_position::VehicleStopStatus;
    use crate::model;

    fn sample_feed() -> gtfs_rt::FeedMessage {
        gtfs_rt::FeedMessage {
            header: gtfs_rt::FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                incrementality: None,
                timestamp: Some(1_700_000_000),
                feed_version: None,
            },
            entity: vec![
                gtfs_rt::FeedEntity {
                    id: "e1".to_string(),
                    is_deleted: None,
                    trip_update: Some(gtfs_rt::TripUpdate {
                        trip: gtfs_rt::TripDescriptor {
                            trip_id: Some("t1".to_string()),
                            route_id: Some("A".to_string()),
                            start_time: Some("12:00:00".to_string()),
                            start_date: Some("20231114".to_string()),
                            direction_id: None,
                        },
                        vehicle: None,
                        stop_time_update: vec![
                            gtfs_rt::trip_update::StopTimeUpdate {
                                stop_sequence: Some(1),
                                stop_id: Some("A01N".to_string()),
                                arrival: None,
                                departure: None,
                            },
                            gtfs_rt::trip_update::StopTimeUpdate {
                                stop_sequence: Some(2),
                                stop_id: Some("A01S".to_string()),
                                arrival: None,
                                departure: None,
                            },
                        ],
                        timestamp: None,
                        delay: None,
                    }),
                    vehicle: None,
                },
                gtfs_rt::FeedEntity {
                    id: "e2".to_string(),
                    is_deleted: None,
                    trip_update: None,
                    vehicle: Some(gtfs_rt::VehiclePosition {
                        trip: Some(gtfs_rt::TripDescriptor {
                            trip_id: Some("t2".to_string()),
                            ..Default::default()
                        }),
                        vehicle: None,
                        position: None,
                        current_stop_sequence: Some(7),
                        stop_id: Some("A02".to_string()),
                        current_status: Some(VehicleStopStatus::StoppedAt as i32),
                        timestamp: Some(1_700_000_005),
                    }),
                },
            ],
        }
    }

    #[test]
    fn test_envelope_round_trips_into_pipeline_model() {
        let payload = envelope_from_feed(&sample_feed()).unwrap();
        let msg: model::FeedMessage = serde_json::from_slice(&payload).unwrap();

        assert_eq!(msg.header.timestamp, Some(1_700_000_000));
        assert_eq!(msg.event_timestamp_unix, Some(1_700_000_000));
        assert_eq!(msg.entity.len(), 2);

        let tu = msg.entity[0].trip_update.as_ref().unwrap();
        assert_eq!(tu.stop_time_update.len(), 2);
        assert_eq!(tu.trip.as_ref().unwrap().route_id.as_deref(), Some("A"));

        let v = msg.entity[1].vehicle.as_ref().unwrap();
        assert_eq!(v.current_status.as_deref(), Some("STOPPED_AT"));
        assert_eq!(v.current_stop_sequence, Some(7));
    }

    #[test]
    fn test_unique_event_id_format() {
        let payload = envelope_from_feed(&sample_feed()).unwrap();
        let msg: model::FeedMessage = serde_json::from_slice(&payload).unwrap();

        let id = msg.unique_event_id.unwrap();
        let (ts, hash) = id.split_once('-').unwrap();
        assert_eq!(ts, "1700000000");
        assert!(hash.parse::<u64>().is_ok());
    }

    #[test]
    fn test_identical_feeds_get_identical_ids() {
        let a = envelope_from_feed(&sample_feed()).unwrap();
        let b = envelope_from_feed(&sample_feed()).unwrap();

        let id = |p: &[u8]| {
            serde_json::from_slice::<model::FeedMessage>(p)
                .unwrap()
                .unique_event_id
        };
        assert_eq!(id(&a), id(&b));
    }
}
