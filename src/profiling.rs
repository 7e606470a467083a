//! Optional profiling for the process lifetime: a runtime sampler, a
//! diagnostic HTTP listener on localhost, and an execution trace capture.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{extract::State, response::Html, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ProfilingConfig;
use crate::metrics::RuntimeSnapshot;
use crate::shutdown::TaskGroup;
use crate::trace::{TraceCapture, TraceError, TraceSink, TraceStatus};

#[derive(Debug, thiserror::Error)]
pub enum ProfilingError {
    #[error("trace capture failed to start: {0}")]
    Trace(#[from] TraceError),
}

/// A running profiling session.
pub struct ProfilingSession {
    capture: TraceCapture,
    diagnostics_addr: Option<SocketAddr>,
}

impl ProfilingSession {
    /// Start trace capture, then the sampler and diagnostic listener under `group`.
    ///
    /// Trace failures are fatal. A diagnostic listener that cannot bind is
    /// logged and skipped.
    pub async fn start(
        config: &ProfilingConfig,
        port: u16,
        sink: &TraceSink,
        group: &TaskGroup,
    ) -> Result<Self, ProfilingError> {
        let capture = sink.start(&config.trace_dir)?;
        tracing::info!(path = %capture.path().display(), "trace capture started");

        let interval = config.sample_interval();
        group.spawn("runtime-sampler", run_sampler(interval, group.token()));
        tracing::info!(interval_ms = interval.as_millis() as u64, "runtime sampling enabled");

        let diagnostics_addr = match TcpListener::bind(("localhost", port)).await {
            Ok(listener) => {
                let addr = listener.local_addr().ok();
                if let Some(addr) = addr {
                    tracing::info!("profiling listening on http://{addr}/debug/pprof/");
                }
                let router = diagnostics_router(sink.clone());
                group.spawn("diagnostics", serve_diagnostics(listener, router, group.token()));
                addr
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "failed to bind profiling listener");
                None
            }
        };

        Ok(Self {
            capture,
            diagnostics_addr,
        })
    }

    pub fn diagnostics_addr(&self) -> Option<SocketAddr> {
        self.diagnostics_addr
    }

    /// Handle for stopping the trace without holding on to the session.
    pub fn capture(&self) -> TraceCapture {
        self.capture.clone()
    }
}

async fn run_sampler(interval: Duration, token: CancellationToken) -> Result<(), Infallible> {
    let handle = tokio::runtime::Handle::current();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => RuntimeSnapshot::capture(&handle).record(),
        }
    }
}

async fn serve_diagnostics(
    listener: TcpListener,
    router: Router,
    token: CancellationToken,
) -> Result<(), Infallible> {
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "profiling listener failed");
    }
    Ok(())
}

#[derive(Clone)]
struct DiagnosticsState {
    sink: TraceSink,
}

pub fn diagnostics_router(sink: TraceSink) -> Router {
    Router::new()
        .route("/debug/pprof/", get(index))
        .route("/debug/pprof/runtime", get(runtime))
        .route("/debug/pprof/trace", get(trace_status))
        .with_state(DiagnosticsState { sink })
}

async fn index() -> Html<&'static str> {
    Html(
        r#"<html>
<head><title>/debug/pprof/</title></head>
<body>
<h1>/debug/pprof/</h1>
<ul>
<li><a href="runtime">runtime</a>: tokio runtime metrics snapshot</li>
<li><a href="trace">trace</a>: execution trace capture status</li>
</ul>
</body>
</html>"#,
    )
}

async fn runtime() -> Json<RuntimeSnapshot> {
    Json(RuntimeSnapshot::capture(&tokio::runtime::Handle::current()))
}

async fn trace_status(State(state): State<DiagnosticsState>) -> Json<TraceStatus> {
    Json(state.sink.status())
}
