//! Prometheus recorder setup and HTTP request metrics.

use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the process-wide Prometheus recorder.
///
/// Must be called once, before any metric is recorded.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Middleware recording request count and latency per route.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

/// Point-in-time view of the tokio runtime, recorded by the profiling sampler.
#[derive(Debug, Clone, Copy, serde::Serialize, PartialEq, Eq)]
pub struct RuntimeSnapshot {
    pub workers: usize,
    pub alive_tasks: usize,
    pub global_queue_depth: usize,
}

impl RuntimeSnapshot {
    pub fn capture(handle: &tokio::runtime::Handle) -> Self {
        let m = handle.metrics();
        Self {
            workers: m.num_workers(),
            alive_tasks: m.num_alive_tasks(),
            global_queue_depth: m.global_queue_depth(),
        }
    }

    pub fn record(&self) {
        metrics::gauge!("runtime_workers").set(self.workers as f64);
        metrics::gauge!("runtime_alive_tasks").set(self.alive_tasks as f64);
        metrics::gauge!("runtime_global_queue_depth").set(self.global_queue_depth as f64);
    }
}
