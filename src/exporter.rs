//! Auxiliary exporter: a status page and the Prometheus scrape endpoint.
//!
//! This is a diagnostic side channel. Failing to bind or serve is logged and
//! never takes the supervisor down.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{extract::State, response::Html, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ExporterConfig;
use crate::metrics::track_metrics;

const INDEX_PAGE: &str = r#"<html>
	<head><title>Metrics Exporter</title></head>
	<body>
		<h1>Metrics Exporter</h1>
		<p><a href="/metrics">Metrics</a></p>
	</body>
</html>"#;

#[derive(Clone)]
struct ExporterState {
    metrics: PrometheusHandle,
}

pub fn router(metrics: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/metrics", get(render_metrics))
        .with_state(ExporterState { metrics })
        .layer(axum::middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

async fn render_metrics(State(state): State<ExporterState>) -> String {
    state.metrics.render()
}

/// Bind the exporter listener. Errors are logged and yield `None`.
pub async fn bind(config: &ExporterConfig) -> Option<TcpListener> {
    let addr = config.addr();
    match TcpListener::bind(&addr).await {
        Ok(listener) => Some(listener),
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind exporter, continuing without it");
            None
        }
    }
}

/// Serve until `token` is cancelled.
pub async fn serve(
    listener: TcpListener,
    metrics: PrometheusHandle,
    token: CancellationToken,
) -> Result<(), Infallible> {
    let local_addr: Option<SocketAddr> = listener.local_addr().ok();
    if let Some(addr) = local_addr {
        tracing::info!("exporter listening on {addr}");
    }

    let result = axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
    match result {
        Ok(()) => tracing::debug!("exporter stopped"),
        Err(e) => tracing::error!(error = %e, "exporter failed"),
    }
    Ok(())
}
