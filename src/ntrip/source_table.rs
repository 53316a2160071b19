//! Caster source table records.

use serde::{Deserialize, Serialize};

/// One `STR` record of a caster source table.
///
/// Only the first four fields are guaranteed; casters routinely leave the
/// rest empty or cut the record short.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceTableEntry {
    pub mountpoint: String,
    pub identifier: String,
    pub format: String,
    pub format_details: String,
    pub carrier: String,
    pub nav_system: String,
    pub network: String,
    pub country: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub nmea: bool,
    pub solution: String,
    pub generator: String,
    pub compression: String,
    pub authentication: String,
    pub fee: bool,
    pub bitrate: Option<u32>,
}

impl SourceTableEntry {
    /// Parses the fields following `STR;`. Returns `None` when one of the
    /// mandatory fields is missing.
    pub fn parse(record: &str) -> Option<SourceTableEntry> {
        let fields: Vec<&str> = record.split(';').map(str::trim).collect();
        if fields.len() < 4 || fields[0].is_empty() {
            return None;
        }
        let text = |i: usize| fields.get(i).map(|s| s.to_string()).unwrap_or_default();
        let flag = |i: usize| fields.get(i).map(|s| *s == "1" || s.eq_ignore_ascii_case("y"));

        Some(SourceTableEntry {
            mountpoint: text(0),
            identifier: text(1),
            format: text(2),
            format_details: text(3),
            carrier: text(4),
            nav_system: text(5),
            network: text(6),
            country: text(7),
            latitude: fields.get(8).and_then(|s| s.parse().ok()),
            longitude: fields.get(9).and_then(|s| s.parse().ok()),
            nmea: flag(10).unwrap_or(false),
            solution: text(11),
            generator: text(12),
            compression: text(13),
            authentication: text(14),
            fee: flag(15).unwrap_or(false),
            bitrate: fields.get(16).and_then(|s| s.parse().ok()),
        })
    }
}

/// Extracts every well-formed `STR` record from a full caster response.
///
/// The header block must be terminated by a blank line; a response without
/// one yields an empty table.
pub fn parse_source_table(response: &str) -> Vec<SourceTableEntry> {
    let body = match response.split_once("\r\n\r\n") {
        Some((_, body)) => body,
        None => match response.split_once("\n\n") {
            Some((_, body)) => body,
            None => return Vec::new(),
        },
    };

    body.split("STR;")
        .skip(1)
        .filter_map(|chunk| {
            let record = chunk.lines().next().unwrap_or_default();
            SourceTableEntry::parse(record)
        })
        .collect()
}
