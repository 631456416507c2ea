/// One scrape cycle: collect varnishstat output, classify every field, resolve
/// identities through the [`DescriptorCache`], and emit samples.
///
/// ```text
/// Idle → Collecting → Classifying → Emitting → Idle
///           │             │
///           └─────────────┴──→ FailureReported
/// ```
///
/// The exporter never terminates the process. A failed cycle is returned to
/// the caller as a [`ScrapeFailure`]; what happens next is the caller's
/// [`ErrorPolicy`].
use crate::classify::{classify, MetricIdentity, MetricKind};
use crate::descriptor::DescriptorCache;
use crate::document::{self, DocumentError};
use crate::varnishstat::StatsError;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Anything that can produce one raw `varnishstat -j` document per call.
pub trait StatsSource: Send + Sync + 'static {
    fn scrape(&self) -> impl Future<Output = Result<Vec<u8>, StatsError>> + Send;
}

/// One exported value. Rebuilt on every cycle.
#[derive(Debug, Clone)]
pub struct Sample {
    pub identity: Arc<MetricIdentity>,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Collecting,
    Classifying,
    Emitting,
    FailureReported,
}

/// Why a cycle failed.
#[derive(Debug)]
pub enum ScrapeError {
    Stats(StatsError),
    Document(DocumentError),
}

impl std::fmt::Display for ScrapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScrapeError::Stats(e) => write!(f, "{e}"),
            ScrapeError::Document(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ScrapeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScrapeError::Stats(e) => Some(e),
            ScrapeError::Document(e) => Some(e),
        }
    }
}

/// A failed cycle, with whatever varnishstat printed for diagnosis.
#[derive(Debug)]
pub struct ScrapeFailure {
    /// State the cycle was in when it failed.
    pub stage: CycleState,
    pub error: ScrapeError,
    /// Raw varnishstat output, possibly empty.
    pub buffer: Vec<u8>,
}

impl std::fmt::Display for ScrapeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scrape failed while {:?}: {}", self.stage, self.error)
    }
}

impl std::error::Error for ScrapeFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Summary of a successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub emitted: usize,
    pub skipped: usize,
    pub duration: Duration,
}

#[derive(Debug)]
pub enum ScrapeOutcome {
    Samples(Vec<Sample>),
    Failed(ScrapeFailure),
}

/// What the outermost layer should do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Continue,
    Terminate { code: i32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub exit_on_error: bool,
}

impl ErrorPolicy {
    pub fn action(&self) -> FailureAction {
        if self.exit_on_error {
            FailureAction::Terminate { code: 1 }
        } else {
            FailureAction::Continue
        }
    }
}

pub struct Exporter<S> {
    source: S,
    cache: DescriptorCache,
    serve_stale_on_error: bool,
    last_good: RwLock<Option<Vec<Sample>>>,
    up: AtomicBool,
    total_scrapes: AtomicU64,
    parse_failures: AtomicU64,
    last_duration_us: AtomicU64,
}

/// The exporter's own metrics. Fields from varnishstat that map onto one of
/// these names are skipped.
const SELF_METRICS: [(&str, MetricKind, &str); 4] = [
    (
        "varnish_up",
        MetricKind::Gauge,
        "Was the last scrape of varnish successful.",
    ),
    (
        "varnish_exporter_total_scrapes",
        MetricKind::Counter,
        "Current total varnish scrapes.",
    ),
    (
        "varnish_exporter_json_parse_failures",
        MetricKind::Counter,
        "Number of errors while parsing varnishstat JSON.",
    ),
    (
        "varnish_exporter_scrape_duration_seconds",
        MetricKind::Gauge,
        "Duration of the last varnishstat scrape.",
    ),
];

fn enter(state: &mut CycleState, next: CycleState) {
    tracing::debug!(from = ?*state, to = ?next, "scrape cycle transition");
    *state = next;
}

impl<S: StatsSource> Exporter<S> {
    pub fn new(source: S, serve_stale_on_error: bool) -> Self {
        let cache = DescriptorCache::new();
        for (name, kind, help) in SELF_METRICS {
            cache.resolve(name, kind, help);
        }
        Self {
            source,
            cache,
            serve_stale_on_error,
            last_good: RwLock::new(None),
            up: AtomicBool::new(false),
            total_scrapes: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            last_duration_us: AtomicU64::new(0),
        }
    }

    /// Run one cycle, streaming samples into `sink`.
    ///
    /// The sink is consumed and dropped before this returns, success or
    /// failure, so a reader draining the other end always sees it close.
    pub async fn scrape(
        &self,
        sink: mpsc::UnboundedSender<Sample>,
    ) -> Result<CycleReport, ScrapeFailure> {
        let start = Instant::now();
        self.total_scrapes.fetch_add(1, Ordering::Relaxed);

        let mut state = CycleState::Idle;
        let result = self.run_cycle(&mut state, &sink).await;
        drop(sink);

        let duration = start.elapsed();
        self.last_duration_us
            .store(duration.as_micros() as u64, Ordering::Relaxed);
        self.up.store(result.is_ok(), Ordering::Relaxed);

        match result {
            Ok((emitted, skipped)) => {
                enter(&mut state, CycleState::Idle);
                tracing::debug!(
                    emitted,
                    skipped,
                    descriptors = self.cache.len(),
                    duration_ms = duration.as_millis() as u64,
                    "scrape done"
                );
                Ok(CycleReport {
                    emitted,
                    skipped,
                    duration,
                })
            }
            Err(failure) => {
                enter(&mut state, CycleState::FailureReported);
                tracing::error!(stage = ?failure.stage, error = %failure.error, "varnishstat scrape failed");
                if !failure.buffer.is_empty() {
                    tracing::error!(
                        output = %String::from_utf8_lossy(&failure.buffer),
                        "varnishstat output"
                    );
                }
                enter(&mut state, CycleState::Idle);
                Err(failure)
            }
        }
    }

    async fn run_cycle(
        &self,
        state: &mut CycleState,
        sink: &mpsc::UnboundedSender<Sample>,
    ) -> Result<(usize, usize), ScrapeFailure> {
        enter(state, CycleState::Collecting);
        let buffer = match self.source.scrape().await {
            Ok(buffer) => buffer,
            Err(e) => {
                return Err(ScrapeFailure {
                    stage: *state,
                    buffer: e.diagnostic().to_vec(),
                    error: ScrapeError::Stats(e),
                })
            }
        };

        enter(state, CycleState::Classifying);
        let parsed = match document::parse(&buffer) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.parse_failures.fetch_add(1, Ordering::Relaxed);
                return Err(ScrapeFailure {
                    stage: *state,
                    error: ScrapeError::Document(e),
                    buffer,
                });
            }
        };

        for rejected in &parsed.rejected {
            tracing::warn!(field = %rejected.name, reason = %rejected.reason, "skipping unparseable field");
        }
        self.parse_failures
            .fetch_add(parsed.rejected.len() as u64, Ordering::Relaxed);
        let mut skipped = parsed.rejected.len();

        let observed_at = Utc::now();
        let mut seen: HashSet<String> = SELF_METRICS
            .iter()
            .map(|(name, _, _)| name.to_string())
            .collect();
        let mut samples = Vec::with_capacity(parsed.fields.len());
        for field in &parsed.fields {
            let identity = self.cache.resolve_identity(&classify(field));
            if !seen.insert(identity.canonical_name.clone()) {
                tracing::warn!(
                    field = %field.name,
                    metric = %identity.canonical_name,
                    "field maps to a metric already emitted this scrape, skipping"
                );
                skipped += 1;
                continue;
            }
            samples.push(Sample {
                identity,
                value: field.value,
                observed_at,
            });
        }

        enter(state, CycleState::Emitting);
        if self.serve_stale_on_error {
            *self.last_good.write().unwrap_or_else(|e| e.into_inner()) = Some(samples.clone());
        }
        let emitted = samples.len();
        for sample in samples {
            if sink.send(sample).is_err() {
                tracing::debug!("sample receiver dropped, stopping emit");
                break;
            }
        }
        Ok((emitted, skipped))
    }

    /// Run one cycle and gather its samples.
    pub async fn collect(&self) -> ScrapeOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = self.scrape(tx).await;
        let mut samples = Vec::new();
        while let Some(sample) = rx.recv().await {
            samples.push(sample);
        }
        match result {
            Ok(_) => ScrapeOutcome::Samples(samples),
            Err(failure) => ScrapeOutcome::Failed(failure),
        }
    }

    /// What to expose for a failed cycle: nothing, or the last good snapshot
    /// when stale serving is enabled.
    pub fn fallback_samples(&self) -> Vec<Sample> {
        if !self.serve_stale_on_error {
            return Vec::new();
        }
        self.last_good
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    /// The exporter's own health and bookkeeping metrics.
    pub fn self_samples(&self) -> Vec<Sample> {
        let observed_at = Utc::now();
        let up = if self.up.load(Ordering::Relaxed) { 1.0 } else { 0.0 };
        let values = [
            up,
            self.total_scrapes.load(Ordering::Relaxed) as f64,
            self.parse_failures.load(Ordering::Relaxed) as f64,
            self.last_duration_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        ];
        SELF_METRICS
            .into_iter()
            .zip(values)
            .map(|((name, kind, help), value)| Sample {
                identity: self.cache.resolve(name, kind, help),
                value,
                observed_at,
            })
            .collect()
    }
}
