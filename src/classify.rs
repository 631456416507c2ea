/// Field classification: turns a varnishstat field into a Prometheus metric
/// identity (canonical name, counter/gauge, help text).
///
/// Classification is total. Any name, however mangled, yields a usable
/// identity; a field whose kind cannot be determined is exposed as a gauge.
use crate::document::{KindHint, RawField};

/// Prefix shared by every exported metric name.
pub const NAMESPACE: &str = "varnish";

/// Numeric kind of an exported metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    /// Name used on the exposition `# TYPE` line.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl From<KindHint> for MetricKind {
    fn from(hint: KindHint) -> Self {
        match hint {
            KindHint::Counter => MetricKind::Counter,
            KindHint::Gauge => MetricKind::Gauge,
        }
    }
}

/// Stable, exposed identity of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricIdentity {
    pub canonical_name: String,
    pub kind: MetricKind,
    pub help_text: String,
}

/// Fields describing current state rather than running totals.
const GAUGE_FIELDS: &[&str] = &["uptime", "threads", "pools"];
const GAUGE_PREFIXES: &[&str] = &["n_", "g_"];

const COUNTER_PREFIXES: &[&str] = &["s_", "c_"];
const COUNTER_KEYWORDS: &[&str] = &[
    "hit", "miss", "pass", "bytes", "req", "fail", "drop", "created", "destroyed", "limited",
    "overflow", "conn", "fetch", "sess",
];

/// Split `MAIN.cache_hit` into `("MAIN", "cache_hit")`. Only the first dot
/// separates; the rest stays with the field.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((subsystem, field)) => (subsystem, field),
        None => ("", name),
    }
}

/// Guess a kind from the field name alone.
pub fn kind_from_name(field: &str) -> MetricKind {
    let field = field.to_ascii_lowercase();
    // Only the last segment names the statistic: `VBE.boot.default.req`.
    let leaf = field.rsplit('.').next().unwrap_or("");

    if GAUGE_FIELDS.contains(&leaf) || GAUGE_PREFIXES.iter().any(|p| leaf.starts_with(p)) {
        return MetricKind::Gauge;
    }
    if COUNTER_PREFIXES.iter().any(|p| leaf.starts_with(p))
        || leaf.ends_with("_total")
        || COUNTER_KEYWORDS.iter().any(|k| leaf.contains(k))
    {
        return MetricKind::Counter;
    }
    MetricKind::Gauge
}

/// Lowercase ASCII alphanumerics survive; every other run of characters
/// becomes a single `_`. Leading and trailing underscores are trimmed.
pub fn sanitize(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Canonical exposed name for a raw varnishstat field name.
pub fn canonical_name(name: &str) -> String {
    let (subsystem, field) = split_name(name);
    let parts: Vec<String> = [sanitize(subsystem), sanitize(field)]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        return format!("{NAMESPACE}_unnamed");
    }
    format!("{NAMESPACE}_{}", parts.join("_"))
}

/// Map one raw field to its metric identity.
pub fn classify(field: &RawField) -> MetricIdentity {
    let (_, leaf) = split_name(&field.name);
    let kind = field
        .kind_hint
        .map(MetricKind::from)
        .unwrap_or_else(|| kind_from_name(leaf));

    let help_text = match field.description.as_deref().map(str::trim) {
        Some(desc) if !desc.is_empty() => desc.to_string(),
        _ => format!("Varnish statistic {}", field.name),
    };

    MetricIdentity {
        canonical_name: canonical_name(&field.name),
        kind,
        help_text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, hint: Option<KindHint>) -> RawField {
        RawField {
            name: name.to_string(),
            value: 0.0,
            kind_hint: hint,
            description: None,
        }
    }

    fn is_valid_metric_name(name: &str) -> bool {
        let mut chars = name.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("MAIN.cache_hit"), ("MAIN", "cache_hit"));
        assert_eq!(split_name("VBE.boot.default.req"), ("VBE", "boot.default.req"));
        assert_eq!(split_name("uptime"), ("", "uptime"));
        assert_eq!(split_name(""), ("", ""));
    }

    #[test]
    fn test_canonical_names() {
        assert_eq!(canonical_name("MAIN.uptime"), "varnish_main_uptime");
        assert_eq!(canonical_name("MAIN.cache_hit"), "varnish_main_cache_hit");
        assert_eq!(
            canonical_name("VBE.boot.default.req"),
            "varnish_vbe_boot_default_req"
        );
        assert_eq!(
            canonical_name("VBE.reload_20240301(127.0.0.1,,8080).happy"),
            "varnish_vbe_reload_20240301_127_0_0_1_8080_happy"
        );
        assert_eq!(canonical_name("SMA.s0.g_bytes"), "varnish_sma_s0_g_bytes");
        assert_eq!(canonical_name("uptime"), "varnish_uptime");
    }

    #[test]
    fn test_malformed_names_still_classify() {
        for name in ["", ".", "...", "!!!", "-.-", " ", "ÄÖÜ.ß", "\n\t", ".x", "x."] {
            let id = classify(&raw(name, None));
            assert!(
                is_valid_metric_name(&id.canonical_name),
                "{name:?} -> {:?}",
                id.canonical_name
            );
            assert!(id.canonical_name.starts_with("varnish_"));
            assert!(!id.help_text.is_empty());
        }
        assert_eq!(canonical_name(""), "varnish_unnamed");
        assert_eq!(canonical_name("!!!.???"), "varnish_unnamed");
        assert_eq!(canonical_name(".x"), "varnish_x");
    }

    #[test]
    fn test_sanitize_collapses_and_trims() {
        assert_eq!(sanitize("__A--b__"), "a_b");
        assert_eq!(sanitize("a..b"), "a_b");
        assert_eq!(sanitize("---"), "");
    }

    #[test]
    fn test_flag_wins_over_heuristic() {
        // uptime looks like a gauge, but the tool's flag decides.
        assert_eq!(
            classify(&raw("MAIN.uptime", Some(KindHint::Counter))).kind,
            MetricKind::Counter
        );
        assert_eq!(
            classify(&raw("MAIN.cache_hit", Some(KindHint::Gauge))).kind,
            MetricKind::Gauge
        );
    }

    #[test]
    fn test_heuristic_kinds() {
        for name in [
            "MAIN.cache_hit",
            "MAIN.cache_miss",
            "MAIN.s_req_bodybytes",
            "MAIN.client_req",
            "MAIN.backend_fail",
            "MAIN.threads_created",
            "MAIN.threads_limited",
            "SMA.s0.c_req",
            "VBE.boot.default.bereq_hdrbytes",
            "MAIN.requests_total",
        ] {
            assert_eq!(classify(&raw(name, None)).kind, MetricKind::Counter, "{name}");
        }
        for name in [
            "MAIN.uptime",
            "MAIN.threads",
            "MAIN.pools",
            "MAIN.n_object",
            "SMA.s0.g_bytes",
            "MAIN.vmods",
            "",
            "???",
        ] {
            assert_eq!(classify(&raw(name, None)).kind, MetricKind::Gauge, "{name}");
        }
    }

    #[test]
    fn test_help_text_from_description() {
        let mut field = raw("MAIN.cache_hit", None);
        field.description = Some("Cache hits".to_string());
        assert_eq!(classify(&field).help_text, "Cache hits");

        field.description = Some("   ".to_string());
        assert_eq!(classify(&field).help_text, "Varnish statistic MAIN.cache_hit");

        field.description = None;
        assert_eq!(classify(&field).help_text, "Varnish statistic MAIN.cache_hit");
    }

    #[test]
    fn test_classify_is_deterministic() {
        let field = RawField {
            name: "MAIN.sess_conn".to_string(),
            value: 7.0,
            kind_hint: None,
            description: Some("Sessions accepted".to_string()),
        };
        assert_eq!(classify(&field), classify(&field.clone()));
    }
}
