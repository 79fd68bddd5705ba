//! Output formatters for stored events and topic counts.
//!
//! Supports human-readable (with colors), JSON, and NDJSON formats.

use std::collections::BTreeMap;
use std::io::{self, Write};

use crate::models::StoredRecord;

// ANSI color codes
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const CYAN: &str = "\x1b[96m";

/// Longest payload preview shown in human output.
const PAYLOAD_PREVIEW_CHARS: usize = 80;

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Human-readable terminal output (default)
    #[default]
    Human,
    /// JSON array
    Json,
    /// Newline-delimited JSON (one object per line)
    Ndjson,
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            "ndjson" => Ok(Self::Ndjson),
            _ => Err(format!("unknown format: {s} (expected: human, json, ndjson)")),
        }
    }
}

fn to_io(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Shorten a payload for one-line display.
fn payload_preview(record: &StoredRecord) -> String {
    let full = serde_json::Value::Object(record.payload.clone()).to_string();
    if full.chars().count() <= PAYLOAD_PREVIEW_CHARS {
        return full;
    }
    let cut: String = full.chars().take(PAYLOAD_PREVIEW_CHARS - 1).collect();
    format!("{cut}…")
}

/// Write records in human-readable format.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_human<W: Write>(writer: &mut W, records: &[StoredRecord]) -> io::Result<()> {
    for record in records {
        let time = record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(
            writer,
            "{DIM}{time} UTC{RESET} │ {CYAN}{BOLD}{}{RESET} │ {} │ {DIM}{}{RESET} │ {}",
            record.topic,
            record.event_id,
            record.source,
            payload_preview(record)
        )?;
    }
    Ok(())
}

/// Write records as a JSON array.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub fn write_json<W: Write>(writer: &mut W, records: &[StoredRecord]) -> io::Result<()> {
    let json = serde_json::to_string_pretty(records).map_err(to_io)?;
    writeln!(writer, "{json}")
}

/// Write records as newline-delimited JSON.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub fn write_ndjson<W: Write>(writer: &mut W, records: &[StoredRecord]) -> io::Result<()> {
    for record in records {
        let json = serde_json::to_string(record).map_err(to_io)?;
        writeln!(writer, "{json}")?;
    }
    Ok(())
}

/// Write records in the specified format.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_records<W: Write>(
    writer: &mut W,
    records: &[StoredRecord],
    format: Format,
) -> io::Result<()> {
    match format {
        Format::Human => write_human(writer, records),
        Format::Json => write_json(writer, records),
        Format::Ndjson => write_ndjson(writer, records),
    }
}

/// Write per-topic counts in the specified format.
///
/// # Errors
///
/// Returns an error if serialization or writing fails.
pub fn write_counts<W: Write>(
    writer: &mut W,
    counts: &BTreeMap<String, u64>,
    format: Format,
) -> io::Result<()> {
    match format {
        Format::Human => {
            let width = counts.keys().map(String::len).max().unwrap_or(0);
            for (topic, count) in counts {
                writeln!(writer, "{CYAN}{topic:width$}{RESET}  {BOLD}{count}{RESET}")?;
            }
            let total: u64 = counts.values().sum();
            writeln!(writer, "{DIM}{} topics, {total} unique events{RESET}", counts.len())
        }
        Format::Json => {
            let json = serde_json::to_string_pretty(counts).map_err(to_io)?;
            writeln!(writer, "{json}")
        }
        Format::Ndjson => {
            for (topic, count) in counts {
                let line = serde_json::json!({ "topic": topic, "count": count });
                writeln!(writer, "{line}")?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> StoredRecord {
        serde_json::from_value(json!({
            "topic": "logs",
            "event_id": id,
            "timestamp": "2025-01-01T00:00:00Z",
            "source": "test",
            "payload": {"message": "x".repeat(200)}
        }))
        .unwrap()
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("human".parse::<Format>().unwrap(), Format::Human);
        assert_eq!("JSON".parse::<Format>().unwrap(), Format::Json);
        assert_eq!("ndjson".parse::<Format>().unwrap(), Format::Ndjson);
        assert!("invalid".parse::<Format>().is_err());
    }

    #[test]
    fn test_ndjson_one_line_per_record() {
        let mut out = Vec::new();
        write_records(&mut out, &[record("a"), record("b")], Format::Ndjson).unwrap();
        let text = String::from_utf8(out).unwrap();

        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: StoredRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, record("b"));
    }

    #[test]
    fn test_human_truncates_payload() {
        let mut out = Vec::new();
        write_records(&mut out, &[record("a")], Format::Human).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains('…'));
        assert!(text.contains("2025-01-01 00:00:00.000"));
    }

    #[test]
    fn test_counts_json() {
        let counts = BTreeMap::from([("a".to_string(), 2), ("b".to_string(), 5)]);
        let mut out = Vec::new();
        write_counts(&mut out, &counts, Format::Json).unwrap();
        let parsed: BTreeMap<String, u64> = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, counts);
    }
}
