//! Prometheus text exposition.
//!
//! Every sample becomes its own single-series metric family, described by the
//! identity the descriptor cache handed out, and is encoded with the
//! `prometheus` crate's [`TextEncoder`].

use crate::classify::MetricKind;
use crate::exporter::Sample;
use prometheus::core::Desc;
use prometheus::proto::{self, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use std::collections::HashMap;

/// Content type for text format version 0.0.4.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Build one family per sample, in the order given.
///
/// A sample whose name or help the Prometheus data model rejects is dropped
/// with a warning instead of failing the whole exposition.
pub fn families(samples: &[Sample]) -> Vec<MetricFamily> {
    samples
        .iter()
        .filter_map(|sample| match family(sample) {
            Ok(family) => Some(family),
            Err(e) => {
                tracing::warn!(metric = %sample.identity.canonical_name, "dropping invalid metric: {e}");
                None
            }
        })
        .collect()
}

fn family(sample: &Sample) -> prometheus::Result<MetricFamily> {
    let identity = &sample.identity;
    let desc = Desc::new(
        identity.canonical_name.clone(),
        identity.help_text.clone(),
        Vec::new(),
        HashMap::new(),
    )?;

    let mut metric = proto::Metric::default();
    let mut family = MetricFamily::default();
    match identity.kind {
        MetricKind::Counter => {
            let mut counter = proto::Counter::default();
            counter.set_value(sample.value);
            metric.set_counter(counter);
            family.set_field_type(MetricType::COUNTER);
        }
        MetricKind::Gauge => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(sample.value);
            metric.set_gauge(gauge);
            family.set_field_type(MetricType::GAUGE);
        }
    }
    family.set_name(desc.fq_name);
    family.set_help(desc.help);
    family.mut_metric().push(metric);
    Ok(family)
}

/// Encode samples as exposition text.
pub fn render(samples: &[Sample]) -> prometheus::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(samples.len() * 96);
    TextEncoder::new().encode(&families(samples), &mut buffer)?;
    Ok(buffer)
}
