use crate::config::WebConfig;
use axum::response::IntoResponse;
use crate::exporter::{ErrorPolicy, Exporter, ScrapeOutcome, StatsSource};
use std::sync::Arc;

struct MetricsState<S> {
    exporter: Arc<Exporter<S>>,
    policy: ErrorPolicy,
}

impl<S> Clone for MetricsState<S> {
    fn clone(&self) -> Self {
        Self {
            exporter: Arc::clone(&self.exporter),
            policy: self.policy,
        }
    }
}

/// Build the HTTP router.
///
/// Without an exporter (varnishstat version unknown) the metrics path is not
/// routed, but the health endpoint still answers.
pub fn router<S: StatsSource>(
    web: &WebConfig,
    exporter: Option<Arc<Exporter<S>>>,
    policy: ErrorPolicy,
) -> axum::Router {
    use axum::{routing::get, Router};
    use tower_http::trace::TraceLayer;

    let mut app = Router::new();
    if let Some(exporter) = exporter {
        app = app.merge(
            Router::new()
                .route(&web.telemetry_path, get(metrics::<S>))
                .with_state(MetricsState { exporter, policy }),
        );
    }
    if !web.health_path.is_empty() {
        app = app.route(&web.health_path, get(health));
    }
    if web.telemetry_path != "/" && web.health_path != "/" {
        let page = index_page(&web.telemetry_path);
        app = app.route("/", get(move || async move { axum::response::Html(page) }));
    }
    app.layer(TraceLayer::new_for_http())
}

pub async fn run(app: axum::Router, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("serve listening on {local_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(crate::signals::shutdown_signal())
        .await?;
    Ok(())
}

/// One scrape per poll. Failures go through the error policy; when the
/// process survives, the poller gets the fallback samples plus `varnish_up 0`.
async fn metrics<S: StatsSource>(
    axum::extract::State(state): axum::extract::State<MetricsState<S>>,
) -> axum::response::Response {
    let mut samples = match state.exporter.collect().await {
        ScrapeOutcome::Samples(samples) => samples,
        ScrapeOutcome::Failed(failure) => {
            crate::enforce(state.policy.action(), &failure.to_string());
            state.exporter.fallback_samples()
        }
    };
    samples.extend(state.exporter.self_samples());
    match crate::exposition::render(&samples) {
        Ok(body) => (
            axum::http::StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, crate::exposition::CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {e}");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Only proves the process accepts connections; varnishstat is not probed.
async fn health() -> &'static str {
    "Ok\n"
}

fn index_page(telemetry_path: &str) -> String {
    format!(
        r#"<html>
    <head><title>Varnish Exporter</title></head>
    <body>
        <h1>Varnish Exporter</h1>
        <p><a href="{telemetry_path}">Metrics</a></p>
    </body>
</html>"#
    )
}
