mod classify;
mod config;
mod descriptor;
mod document;
mod exporter;
mod exposition;
#[cfg(feature = "serve")]
mod serve;
#[cfg(feature = "serve")]
mod signals;
mod varnishstat;
mod version;

use clap::Parser;
use config::ExporterConfig;
use exporter::{ErrorPolicy, Exporter, FailureAction};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use varnishstat::{Invocation, VarnishStat};
use version::VarnishVersion;

/// Prometheus exporter for varnish: runs varnishstat on every poll and
/// republishes its counters as typed metrics.
#[derive(Parser, Debug)]
#[command(name = "varnish-exporter", version, about)]
pub struct Cli {
    /// Config file path (TOML); flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address on which to expose metrics and web interface
    #[arg(long = "web.listen-address", value_name = "ADDR")]
    listen_address: Option<String>,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path", value_name = "PATH")]
    telemetry_path: Option<String>,

    /// Path under which to expose healthcheck. Disabled unless configured
    #[arg(long = "web.health-path", value_name = "PATH")]
    health_path: Option<String>,

    /// Path to varnishstat
    #[arg(long = "varnishstat-path", value_name = "PATH")]
    varnishstat_path: Option<String>,

    /// varnishstat -n value
    #[arg(short = 'n', value_name = "INSTANCE")]
    instance: Option<String>,

    /// varnishstat -N value (varnish >= 4.0)
    #[arg(short = 'N', value_name = "VSM")]
    vsm: Option<String>,

    /// Docker container name to exec varnishstat in
    #[arg(long = "docker-container-name", value_name = "NAME")]
    docker_container: Option<String>,

    /// Seconds to wait for varnishstat before failing the scrape
    #[arg(long, value_name = "SECS")]
    scrape_timeout: Option<u64>,

    /// Exit process on scrape errors
    #[arg(long)]
    exit_on_errors: bool,

    /// Serve the last successful scrape when varnishstat fails
    #[arg(long)]
    serve_stale_on_error: bool,

    /// Debug logging (cycle transitions, varnishstat command lines)
    #[arg(short, long)]
    verbose: bool,

    /// Test varnishstat availability, print available metrics and exit
    #[arg(long)]
    test: bool,

    /// Log without timestamps
    #[arg(long)]
    raw: bool,

    /// Deprecated: not exiting on scrape errors is the default
    #[arg(long, hide = true)]
    no_exit: bool,
}

impl Cli {
    /// Flags given on the command line win over the config file.
    fn apply(&self, config: &mut ExporterConfig) {
        if let Some(v) = &self.listen_address {
            config.web.listen_address = v.clone();
        }
        if let Some(v) = &self.telemetry_path {
            config.web.telemetry_path = v.clone();
        }
        if let Some(v) = &self.health_path {
            config.web.health_path = v.clone();
        }
        if let Some(v) = &self.varnishstat_path {
            config.varnishstat.path = v.clone();
        }
        if let Some(v) = &self.instance {
            config.varnishstat.instance = v.clone();
        }
        if let Some(v) = &self.vsm {
            config.varnishstat.vsm = v.clone();
        }
        if let Some(v) = &self.docker_container {
            config.varnishstat.docker_container = v.clone();
        }
        if let Some(v) = self.scrape_timeout {
            config.varnishstat.timeout_secs = v;
        }
        config.policy.exit_on_errors |= self.exit_on_errors;
        config.policy.serve_stale_on_error |= self.serve_stale_on_error;
    }
}

fn init_logging(verbose: bool, raw: bool) {
    let default_filter = if verbose {
        "varnish_exporter=debug,tower_http=debug"
    } else {
        "varnish_exporter=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if raw {
        builder.without_time().init();
    } else {
        builder.init();
    }
}

/// The only place a scrape failure may end the process.
#[cfg(feature = "serve")]
pub(crate) fn enforce(action: FailureAction, context: &str) {
    if let FailureAction::Terminate { code } = action {
        tracing::error!(code, "{context}; exiting on error");
        std::process::exit(code);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.raw);
    tracing::debug!(?cli, "parsed CLI arguments");

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let mut config = match ExporterConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return 1;
        }
    };
    cli.apply(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {e}");
        return 1;
    }

    if cli.no_exit {
        tracing::warn!(
            "--no-exit is deprecated: not exiting on scrape errors is the default. You can remove this parameter."
        );
    }

    // A test run, or an explicit request, makes any scrape error fatal.
    let policy = ErrorPolicy {
        exit_on_error: cli.test || config.policy.exit_on_errors,
    };

    match serde_json::to_string(&config) {
        Ok(json) => tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            config = %json,
            "varnish-exporter starting"
        ),
        Err(e) => {
            tracing::error!("failed to serialize config: {e}");
            return 1;
        }
    }

    let invocation = Invocation::from_config(&config.varnishstat);
    let version = match VarnishVersion::initialize(&invocation, config.varnishstat.timeout()).await {
        Ok(version) => {
            tracing::info!(%version, via = %invocation, "found varnishstat");
            version
        }
        Err(e) => {
            tracing::error!("varnish version initialize failed: {e}");
            if let FailureAction::Terminate { code } = policy.action() {
                return code;
            }
            tracing::warn!("metrics endpoint disabled until the exporter is restarted");
            VarnishVersion::default()
        }
    };

    let exporter = version.valid.then(|| {
        let source = VarnishStat::new(&config.varnishstat, &version);
        tracing::debug!(args = ?source.args(), "varnishstat arguments");
        Arc::new(Exporter::new(source, config.policy.serve_stale_on_error))
    });

    if let Some(exporter) = &exporter {
        if let Err(code) = startup_scrape(exporter, cli.test, policy).await {
            return code;
        }
    }
    if cli.test {
        return 0;
    }

    serve(&config, exporter, policy).await
}

/// Scrape once before serving so a broken setup shows up at startup.
/// With `list`, every exported metric is logged.
async fn startup_scrape(
    exporter: &Exporter<VarnishStat>,
    list: bool,
    policy: ErrorPolicy,
) -> Result<(), i32> {
    let (tx, mut rx) = mpsc::unbounded_channel::<exporter::Sample>();
    let printer = tokio::spawn(async move {
        while let Some(sample) = rx.recv().await {
            if list {
                let identity = &sample.identity;
                tracing::info!(
                    kind = identity.kind.as_str(),
                    value = sample.value,
                    observed_at = %sample.observed_at.to_rfc3339(),
                    help = %identity.help_text,
                    "{}",
                    identity.canonical_name
                );
            }
        }
    });

    let result = exporter.scrape(tx).await;
    if let Err(e) = printer.await {
        tracing::warn!("metric listing task failed: {e}");
    }

    match result {
        Ok(report) => {
            tracing::info!(
                metrics = report.emitted,
                skipped = report.skipped,
                duration_ms = report.duration.as_millis() as u64,
                "test scrape done"
            );
            Ok(())
        }
        Err(failure) => {
            tracing::error!("startup test: {failure}");
            match policy.action() {
                FailureAction::Terminate { code } => Err(code),
                FailureAction::Continue => Ok(()),
            }
        }
    }
}

#[cfg(feature = "serve")]
async fn serve(
    config: &ExporterConfig,
    exporter: Option<Arc<Exporter<VarnishStat>>>,
    policy: ErrorPolicy,
) -> i32 {
    let addr = config.web.bind_address();
    tracing::info!(
        "server starting on {addr} with metrics path {}",
        config.web.telemetry_path
    );

    let app = serve::router(&config.web, exporter, policy);
    match serve::run(app, &addr).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("server failed: {e}");
            1
        }
    }
}

#[cfg(not(feature = "serve"))]
async fn serve(
    _config: &ExporterConfig,
    _exporter: Option<Arc<Exporter<VarnishStat>>>,
    _policy: ErrorPolicy,
) -> i32 {
    tracing::error!("built without the `serve` feature; only --test is available");
    1
}
