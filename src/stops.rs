//! Stop reference table: loaded once from CSV at startup, shared read-only
//! across all shard workers for the lifetime of the process.

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Metadata for one stop as published in the reference file.
#[derive(Debug, Clone, PartialEq)]
pub struct StopInfo {
    pub stop_id: String,
    pub stop_name: Option<String>,
    pub stop_lat: Option<f64>,
    pub stop_lon: Option<f64>,
}

/// Immutable stop_id -> [`StopInfo`] mapping with the fallback lookup
/// policy: exact match, upper-cased match, then both again with a single
/// trailing alphabetic qualifier stripped.
#[derive(Debug, Default)]
pub struct StopTable {
    stops: HashMap<String, StopInfo>,
}

impl StopTable {
    /// Loads the table from a delimited reference file.
    ///
    /// A header row (first column "stop_id", case-insensitive) is skipped;
    /// rows with fewer than 4 columns are discarded silently; unparsable
    /// lat/lon values are stored as absent.
    pub fn load(path: &str) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("failed to open stops reference file {path}"))?;

        let mut stops = HashMap::new();
        let mut skipped = 0usize;

        for row in reader.records() {
            let row = row.with_context(|| format!("failed to read stops reference file {path}"))?;
            if row.len() < 4 {
                skipped += 1;
                continue;
            }
            let stop_id = row[0].trim();
            if stop_id.is_empty() || stop_id.eq_ignore_ascii_case("stop_id") {
                skipped += 1;
                continue;
            }
            let info = StopInfo {
                stop_id: stop_id.to_string(),
                stop_name: non_empty(&row[1]),
                stop_lat: parse_coord(&row[2]),
                stop_lon: parse_coord(&row[3]),
            };
            stops.insert(info.stop_id.clone(), info);
        }

        if skipped > 0 {
            debug!(skipped, "Discarded short or header rows from stops file");
        }
        if stops.is_empty() {
            warn!(path, "Stops reference file produced an empty table");
        }

        Ok(Self { stops })
    }

    /// Builds a table directly from records.
    pub fn from_stops(records: impl IntoIterator<Item = StopInfo>) -> Self {
        let stops = records
            .into_iter()
            .map(|info| (info.stop_id.clone(), info))
            .collect();
        Self { stops }
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Resolves a raw stop id against the table, first hit wins:
    /// trimmed exact, trimmed upper-cased, then both again with one
    /// trailing alphabetic character stripped.
    pub fn lookup(&self, raw_stop_id: &str) -> Option<&StopInfo> {
        let sid = raw_stop_id.trim();
        if sid.is_empty() {
            return None;
        }
        if let Some(info) = self.get_either(sid) {
            return Some(info);
        }
        let mut chars = sid.chars();
        match chars.next_back() {
            Some(last) if last.is_alphabetic() => self.get_either(chars.as_str()),
            _ => None,
        }
    }

    fn get_either(&self, sid: &str) -> Option<&StopInfo> {
        self.stops
            .get(sid)
            .or_else(|| self.stops.get(&sid.to_uppercase()))
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_coord(value: &str) -> Option<f64> {
    value.trim().parse().ok()
}
