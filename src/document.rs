/// Decoding of `varnishstat -j` output into [`RawField`]s.
///
/// Two layouts exist in the wild:
/// - varnish < 6.5: counters sit directly in the top-level object, next to a
///   `timestamp` string.
/// - varnish >= 6.5: `{"version": 1, "timestamp": ..., "counters": {...}}`.
///
/// Entries are decoded into [`FieldEntry`]; anything else lands in the
/// [`RawEntry::Other`] fallback so a single odd entry never fails the document.
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// varnishstat's own counter/gauge flag, when it provides one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindHint {
    Counter,
    Gauge,
}

impl KindHint {
    /// `c`/`a` are counters, `g`/`i`/`b` are gauges; bitmaps expose as gauges.
    pub fn from_flag(flag: &str) -> Option<KindHint> {
        match flag {
            "c" | "a" => Some(KindHint::Counter),
            "g" | "i" | "b" => Some(KindHint::Gauge),
            _ => None,
        }
    }
}

/// One statistic as read from a single scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct RawField {
    pub name: String,
    pub value: f64,
    pub kind_hint: Option<KindHint>,
    pub description: Option<String>,
}

/// Expected shape of a counter entry.
#[derive(Debug, Deserialize)]
pub struct FieldEntry {
    value: Value,
    #[serde(default)]
    flag: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawEntry {
    Field(FieldEntry),
    Other(Value),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatsDocument {
    Versioned {
        #[allow(dead_code)]
        version: u32,
        counters: BTreeMap<String, RawEntry>,
    },
    Flat(BTreeMap<String, RawEntry>),
}

/// A single entry that could not be turned into a [`RawField`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldParseError {
    pub name: String,
    pub reason: String,
}

impl std::fmt::Display for FieldParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "field {}: {}", self.name, self.reason)
    }
}

impl std::error::Error for FieldParseError {}

/// The whole document could not be decoded.
#[derive(Debug)]
pub struct DocumentError {
    source: serde_json::Error,
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid varnishstat JSON: {}", self.source)
    }
}

impl std::error::Error for DocumentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Result of decoding one document: usable fields plus per-field rejects.
#[derive(Debug, Default)]
pub struct ParsedStats {
    pub fields: Vec<RawField>,
    pub rejected: Vec<FieldParseError>,
}

/// Decode raw varnishstat output. Fields come back ordered by name.
pub fn parse(bytes: &[u8]) -> Result<ParsedStats, DocumentError> {
    let document: StatsDocument =
        serde_json::from_slice(bytes).map_err(|e| DocumentError { source: e })?;
    let entries = match document {
        StatsDocument::Versioned { counters, .. } => counters,
        StatsDocument::Flat(entries) => entries,
    };

    let mut parsed = ParsedStats::default();
    for (name, entry) in entries {
        match entry {
            RawEntry::Field(field) => match field_value(&field.value) {
                Some(value) => parsed.fields.push(RawField {
                    kind_hint: field.flag.as_deref().and_then(KindHint::from_flag),
                    description: field.description,
                    name,
                    value,
                }),
                None => parsed.rejected.push(FieldParseError {
                    reason: format!("value {} is not numeric", field.value),
                    name,
                }),
            },
            // The flat layout mixes metadata such as `timestamp` in with the
            // counters. Only dotted names are meant to be statistics.
            RawEntry::Other(_) if !name.contains('.') => {}
            RawEntry::Other(other) => parsed.rejected.push(FieldParseError {
                reason: format!("unexpected entry {other}"),
                name,
            }),
        }
    }
    Ok(parsed)
}

fn field_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
