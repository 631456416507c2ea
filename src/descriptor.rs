/// Process-lifetime registry of exposed metric identities.
///
/// Prometheus forbids a metric from changing type between scrapes, so the
/// first identity resolved for a canonical name is the one every later scrape
/// sees. Entries are only ever inserted.
use crate::classify::{MetricIdentity, MetricKind};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
pub struct DescriptorCache {
    entries: RwLock<HashMap<String, Arc<MetricIdentity>>>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the identity stored for `canonical_name`, creating it from
    /// `kind`/`help_text` on first sight. Later arguments never overwrite it.
    pub fn resolve(
        &self,
        canonical_name: &str,
        kind: MetricKind,
        help_text: &str,
    ) -> Arc<MetricIdentity> {
        {
            // The map is insert-only, so a poisoned lock still holds consistent data.
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(identity) = entries.get(canonical_name) {
                return Arc::clone(identity);
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        // Another scrape may have inserted between the two locks.
        let identity = entries
            .entry(canonical_name.to_string())
            .or_insert_with(|| {
                tracing::debug!(metric = canonical_name, kind = kind.as_str(), "new metric descriptor");
                Arc::new(MetricIdentity {
                    canonical_name: canonical_name.to_string(),
                    kind,
                    help_text: help_text.to_string(),
                })
            });
        Arc::clone(identity)
    }

    /// Resolve a freshly classified identity through the cache.
    pub fn resolve_identity(&self, candidate: &MetricIdentity) -> Arc<MetricIdentity> {
        self.resolve(&candidate.canonical_name, candidate.kind, &candidate.help_text)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
