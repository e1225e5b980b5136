//! Record enrichment against the stop reference table.

use crate::model::FlatRecord;
use crate::stops::StopTable;

/// Fills the enrichment fields of a record from the stop table.
///
/// Pure and total: always returns a record, a lookup miss just leaves the
/// enrichment fields absent. Direction is derived from the trimmed stop_id
/// alone, independent of whether the lookup matched: any 'S' (case
/// sensitive) means Southbound, otherwise Northbound. Only a record with a
/// missing or empty stop_id keeps direction absent; a whitespace-only id
/// counts as present and classifies like any other unmatched id.
pub fn enrich(mut record: FlatRecord, stops: &StopTable) -> FlatRecord {
    let sid = record
        .stop_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().to_string());

    let Some(sid) = sid else {
        record.stop_name = None;
        record.stop_lat = None;
        record.stop_lon = None;
        record.direction = None;
        return record;
    };

    let info = stops.lookup(&sid);
    record.stop_name = info.and_then(|i| i.stop_name.clone());
    record.stop_lat = info.and_then(|i| i.stop_lat);
    record.stop_lon = info.and_then(|i| i.stop_lon);
    record.direction = Some(if sid.contains('S') {
        "Southbound".to_string()
    } else {
        "Northbound".to_string()
    });

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stops::StopInfo;

    fn table() -> StopTable {
        StopTable::from_stops(vec![StopInfo {
            stop_id: "A01".to_string(),
            stop_name: Some("Inwood - 207 St".to_string()),
            stop_lat: Some(40.868_072),
            stop_lon: Some(-73.919_899),
        }])
    }

    fn record(stop_id: Option<&str>) -> FlatRecord {
        FlatRecord {
            stop_id: stop_id.map(str::to_string),
            ..FlatRecord::default()
        }
    }

    #[test]
    fn test_match_via_suffix_fallback() {
        let enriched = enrich(record(Some("A01N")), &table());
        assert_eq!(enriched.stop_name.as_deref(), Some("Inwood - 207 St"));
        assert_eq!(enriched.stop_lat, Some(40.868_072));
        assert_eq!(enriched.stop_lon, Some(-73.919_899));
        assert_eq!(enriched.direction.as_deref(), Some("Northbound"));
    }

    #[test]
    fn test_southbound_from_stop_id() {
        let enriched = enrich(record(Some("A01S")), &table());
        assert_eq!(enriched.direction.as_deref(), Some("Southbound"));
    }

    #[test]
    fn test_lowercase_s_is_not_southbound() {
        let enriched = enrich(record(Some("a01s")), &table());
        assert_eq!(enriched.direction.as_deref(), Some("Northbound"));
    }

    #[test]
    fn test_miss_leaves_enrichment_absent_but_sets_direction() {
        let enriched = enrich(record(Some("ZZ9")), &table());
        assert_eq!(enriched.stop_name, None);
        assert_eq!(enriched.stop_lat, None);
        assert_eq!(enriched.stop_lon, None);
        assert_eq!(enriched.direction.as_deref(), Some("Northbound"));
    }

    #[test]
    fn test_absent_stop_id_leaves_direction_absent() {
        for r in [record(None), record(Some(""))] {
            let enriched = enrich(r, &table());
            assert_eq!(enriched.stop_name, None);
            assert_eq!(enriched.stop_lat, None);
            assert_eq!(enriched.stop_lon, None);
            assert_eq!(enriched.direction, None);
        }
    }

    #[test]
    fn test_whitespace_stop_id_still_classifies_direction() {
        let enriched = enrich(record(Some("   ")), &table());
        assert_eq!(enriched.stop_name, None);
        assert_eq!(enriched.stop_lat, None);
        assert_eq!(enriched.stop_lon, None);
        assert_eq!(enriched.direction.as_deref(), Some("Northbound"));
    }

    #[test]
    fn test_enrich_is_idempotent() {
        let t = table();
        let once = enrich(record(Some("A01S")), &t);
        let twice = enrich(once.clone(), &t);
        assert_eq!(once, twice);
    }
}
