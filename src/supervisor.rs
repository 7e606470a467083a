//! The process-lifetime supervisor.
//!
//! Lifecycle: `Created → Starting → Running → ShuttingDown → Terminated`.
//! `start` launches the signal listener, optional profiling and the exporter.
//! `shutdown` runs teardown exactly once no matter how many callers race:
//! stop trace capture, close the trace file, cancel the root token, then join
//! the task group within the configured grace period.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::exporter;
use crate::profiling::{ProfilingError, ProfilingSession};
use crate::shutdown::{exit_channel, ExitCode, ExitRequest, ExitSender, TaskError, TaskGroup};
use crate::signals::{self, SignalError, SignalSet};
use crate::trace::{TraceCapture, TraceError, TraceSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("supervisor cannot start from state {0:?}")]
    AlreadyStarted(LifecycleState),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Profiling(#[from] ProfilingError),
}

/// What the one effective shutdown did. Every caller gets the same report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub code: ExitCode,
    pub reason: String,
    pub task_error: Option<TaskError>,
    pub abandoned_tasks: usize,
}

pub struct Supervisor {
    settings: Settings,
    metrics: PrometheusHandle,
    trace_sink: TraceSink,
    root: CancellationToken,
    group: TaskGroup,
    exit: ExitSender,
    exit_rx: Mutex<Option<mpsc::Receiver<ExitRequest>>>,
    state: Mutex<LifecycleState>,
    profiling: Mutex<Option<ProfilingSession>>,
    exporter_addr: OnceLock<SocketAddr>,
    report: OnceCell<ShutdownReport>,
    done: watch::Sender<Option<ShutdownReport>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Supervisor {
    /// `metrics` renders the exporter's `/metrics` page; `trace_sink` is the
    /// writer the process subscriber sends trace records to.
    pub fn new(settings: Settings, metrics: PrometheusHandle, trace_sink: TraceSink) -> Arc<Self> {
        let root = CancellationToken::new();
        let (exit, exit_rx) = exit_channel();
        let group = TaskGroup::new(&root, exit.clone());
        let (done, _) = watch::channel(None);

        Arc::new(Self {
            settings,
            metrics,
            trace_sink,
            root,
            group,
            exit,
            exit_rx: Mutex::new(Some(exit_rx)),
            state: Mutex::new(LifecycleState::Created),
            profiling: Mutex::new(None),
            exporter_addr: OnceLock::new(),
            report: OnceCell::new(),
            done,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = lock(&self.state);
        tracing::debug!(from = ?*state, to = ?next, "lifecycle transition");
        *state = next;
    }

    /// Move to `next` only if the current state is `from`.
    fn transition(&self, from: LifecycleState, next: LifecycleState) -> bool {
        let mut state = lock(&self.state);
        if *state != from {
            return false;
        }
        tracing::debug!(from = ?from, to = ?next, "lifecycle transition");
        *state = next;
        true
    }

    /// Handle internal code uses to request process exit.
    pub fn exit_sender(&self) -> ExitSender {
        self.exit.clone()
    }

    /// A token derived from the root; cancelled when shutdown starts.
    pub fn context(&self) -> CancellationToken {
        self.group.token()
    }

    /// Run `fut` under the task group. An `Err` from it shuts the process
    /// down with [`ExitCode::FAILURE`].
    pub fn spawn<F, E>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.group.spawn(name, fut);
    }

    pub fn exporter_addr(&self) -> Option<SocketAddr> {
        self.exporter_addr.get().copied()
    }

    pub fn diagnostics_addr(&self) -> Option<SocketAddr> {
        lock(&self.profiling)
            .as_ref()
            .and_then(ProfilingSession::diagnostics_addr)
    }

    #[cfg(test)]
    pub fn trace_active(&self) -> bool {
        self.trace_sink.is_active()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        if !self.transition(LifecycleState::Created, LifecycleState::Starting) {
            return Err(SupervisorError::AlreadyStarted(*lock(&self.state)));
        }

        let build = &self.settings.build;
        tracing::info!(
            name = %build.name,
            commit = %build.commit,
            build = %build.buildstamp,
            "Esmeralda server starting"
        );

        let signals = SignalSet::install()?;
        if let Some(exits) = lock(&self.exit_rx).take() {
            tokio::spawn(listen(Arc::clone(self), signals, exits));
        }

        if self.settings.pprof {
            let session = ProfilingSession::start(
                &self.settings.config.profiling,
                self.settings.pprof_port,
                &self.trace_sink,
                &self.group,
            )
            .await?;

            // Teardown sets ShuttingDown before taking the session. Store it
            // only while still Starting.
            let late = {
                let state = lock(&self.state);
                if *state == LifecycleState::Starting {
                    *lock(&self.profiling) = Some(session);
                    None
                } else {
                    Some(session)
                }
            };
            if let Some(session) = late {
                tracing::warn!("shutdown began during startup, stopping trace capture");
                finish_trace(session.capture()).await;
            }
        }

        if !self.root.is_cancelled() {
            if let Some(listener) = exporter::bind(&self.settings.config.exporter).await {
                if let Ok(addr) = listener.local_addr() {
                    let _ = self.exporter_addr.set(addr);
                }
                self.spawn(
                    "exporter",
                    exporter::serve(listener, self.metrics.clone(), self.context()),
                );
            }
        }

        if !self.transition(LifecycleState::Starting, LifecycleState::Running) {
            tracing::debug!("shutdown began during startup, not entering Running");
            return Ok(());
        }
        tracing::info!(pprof = self.settings.pprof, "Esmeralda server running");
        Ok(())
    }

    /// Stop the trace capture if one is running. Used by the signal path so
    /// the trace is flushed before shutdown proceeds.
    pub async fn stop_trace(&self) {
        let capture = lock(&self.profiling).as_ref().map(ProfilingSession::capture);
        if let Some(capture) = capture {
            finish_trace(capture).await;
        }
    }

    /// Shut down with `code`. Only the first call runs teardown; concurrent
    /// and later calls wait for it and return the same report.
    pub async fn shutdown(&self, code: ExitCode, reason: impl Into<String>) -> ShutdownReport {
        let reason = reason.into();
        self.report
            .get_or_init(|| self.teardown(code, reason))
            .await
            .clone()
    }

    async fn teardown(&self, code: ExitCode, reason: String) -> ShutdownReport {
        self.set_state(LifecycleState::ShuttingDown);
        tracing::info!(code = %code, reason = %reason, "shutdown started");

        let session = lock(&self.profiling).take();
        if let Some(session) = session {
            finish_trace(session.capture()).await;
        }

        self.root.cancel();
        let grace = self.settings.config.shutdown.grace_period();
        let outcome = self.group.wait(grace).await;

        self.set_state(LifecycleState::Terminated);
        tracing::info!(
            code = %code,
            reason = %reason,
            abandoned = outcome.abandoned,
            task_error = ?outcome.first_error,
            "shutdown completed"
        );

        let report = ShutdownReport {
            code,
            reason,
            task_error: outcome.first_error,
            abandoned_tasks: outcome.abandoned,
        };
        self.done.send_replace(Some(report.clone()));
        report
    }

    /// Block until shutdown has completed.
    pub async fn wait(&self) -> ShutdownReport {
        let mut rx = self.done.subscribe();
        let report = rx.wait_for(Option::is_some).await.ok().and_then(|r| (*r).clone());
        report.unwrap_or_else(|| ShutdownReport {
            code: ExitCode::FAILURE,
            reason: "supervisor dropped before shutdown".to_string(),
            task_error: None,
            abandoned_tasks: 0,
        })
    }
}

async fn finish_trace(capture: TraceCapture) {
    match capture.stop().await {
        Ok(summary) => tracing::debug!(
            path = %summary.path.display(),
            bytes = summary.bytes_written,
            "trace file closed"
        ),
        Err(TraceError::NotActive) => tracing::debug!("trace capture already stopped"),
        Err(e) => tracing::error!(error = %e, "failed to stop trace capture"),
    }
}

/// Consume the first termination trigger and shut down.
async fn listen(
    supervisor: Arc<Supervisor>,
    mut signals: SignalSet,
    mut exits: mpsc::Receiver<ExitRequest>,
) {
    let trigger = tokio::select! {
        trigger = signals::next_trigger(&mut signals, &mut exits) => trigger,
        _ = supervisor.root.cancelled() => {
            tracing::debug!("signal listener stopping, shutdown already in progress");
            return;
        }
    };
    drop(exits);

    tracing::info!(?trigger, "termination trigger received");
    supervisor.stop_trace().await;
    supervisor.shutdown(trigger.code(), trigger.reason()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExporterConfig, ProfilingConfig, ServerConfig, ShutdownConfig};
    use crate::shutdown::STARTUP_ERROR_REASON;
    use crate::trace::TRACE_FILE_NAME;
    use crate::version::BuildInfo;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn settings(trace_dir: &Path, pprof: bool) -> Settings {
        let config = ServerConfig {
            exporter: ExporterConfig {
                bind: "127.0.0.1".to_string(),
                port: 0,
            },
            profiling: ProfilingConfig {
                trace_dir: trace_dir.to_path_buf(),
                sample_interval_ms: 10,
            },
            shutdown: ShutdownConfig {
                grace_period_secs: 2,
            },
        };
        Settings::new(config, BuildInfo::current("esmeralda")).with_pprof(pprof, 0)
    }

    fn supervisor(trace_dir: &Path, pprof: bool) -> Arc<Supervisor> {
        Supervisor::new(
            settings(trace_dir, pprof),
            PrometheusBuilder::new().build_recorder().handle(),
            TraceSink::new(),
        )
    }

    async fn wait_report(sup: &Supervisor) -> ShutdownReport {
        tokio::time::timeout(Duration::from_secs(5), sup.wait())
            .await
            .expect("shutdown did not complete")
    }

    fn trace_stop_records(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join(TRACE_FILE_NAME))
            .unwrap()
            .lines()
            .filter(|l| l.contains("trace_stop"))
            .count()
    }

    #[tokio::test]
    async fn test_profiling_disabled_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), false);
        assert_eq!(sup.state(), LifecycleState::Created);

        sup.start().await.unwrap();
        assert_eq!(sup.state(), LifecycleState::Running);
        assert!(sup.exporter_addr().is_some());
        assert!(sup.diagnostics_addr().is_none());
        assert!(!sup.trace_active());
        assert!(!dir.path().join(TRACE_FILE_NAME).exists());

        let report = sup.shutdown(ExitCode::SUCCESS, "test").await;
        assert_eq!(report.code, ExitCode::SUCCESS);
        assert_eq!(report.abandoned_tasks, 0);
        assert_eq!(sup.state(), LifecycleState::Terminated);
        assert_eq!(wait_report(&sup).await, report);
        assert!(!dir.path().join(TRACE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_internal_exit_closes_trace() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), true);
        sup.start().await.unwrap();
        assert!(sup.trace_active());
        assert!(sup.diagnostics_addr().is_some());

        assert!(sup.exit_sender().exit(ExitCode::from(7)));
        let report = wait_report(&sup).await;
        assert_eq!(report.code, ExitCode::from(7));
        assert_eq!(report.reason, STARTUP_ERROR_REASON);

        assert!(!sup.trace_active());
        let len = std::fs::metadata(dir.path().join(TRACE_FILE_NAME)).unwrap().len();
        assert!(len > 0);
        assert_eq!(trace_stop_records(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_concurrent_exit_requests_shut_down_once() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), true);
        sup.start().await.unwrap();

        let a = sup.exit_sender();
        let b = sup.exit_sender();
        let t1 = tokio::spawn(async move { a.exit(ExitCode::from(7)) });
        let t2 = tokio::spawn(async move { b.exit(ExitCode::from(7)) });
        t1.await.unwrap();
        t2.await.unwrap();

        let report = wait_report(&sup).await;
        assert_eq!(report.code, ExitCode::from(7));

        let again = sup.shutdown(ExitCode::from(3), "late").await;
        assert_eq!(again, report);
        assert_eq!(trace_stop_records(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_racing_shutdown_calls_share_one_report() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), true);
        sup.start().await.unwrap();

        let s1 = Arc::clone(&sup);
        let s2 = Arc::clone(&sup);
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { s1.shutdown(ExitCode::from(4), "first").await }),
            tokio::spawn(async move { s2.shutdown(ExitCode::from(5), "second").await }),
        );
        let (r1, r2) = (r1.unwrap(), r2.unwrap());
        assert_eq!(r1, r2);
        assert!(r1.code == ExitCode::from(4) || r1.code == ExitCode::from(5));
        assert_eq!(trace_stop_records(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), false);
        sup.start().await.unwrap();
        let err = sup.start().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::AlreadyStarted(LifecycleState::Running)
        ));
        sup.shutdown(ExitCode::SUCCESS, "test").await;
    }

    #[tokio::test]
    async fn test_failing_task_triggers_failure_exit() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), false);
        sup.start().await.unwrap();

        sup.spawn("collector", async { Err::<(), _>("lost upstream") });
        let report = wait_report(&sup).await;
        assert_eq!(report.code, ExitCode::FAILURE);
        assert!(report.reason.contains("collector"));
        assert_eq!(report.task_error.unwrap().message, "lost upstream");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_derived_contexts_quickly() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), false);
        sup.start().await.unwrap();

        let ctx = sup.context().child_token();
        let poller = tokio::spawn(async move {
            let start = Instant::now();
            while !ctx.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            start.elapsed()
        });

        let s = Arc::clone(&sup);
        tokio::spawn(async move { s.shutdown(ExitCode::SUCCESS, "test").await });
        let elapsed = tokio::time::timeout(Duration::from_millis(100), poller)
            .await
            .expect("derived context not cancelled within 100ms")
            .unwrap();
        assert!(elapsed < Duration::from_millis(100));
        wait_report(&sup).await;
    }

    #[tokio::test]
    async fn test_stuck_task_is_abandoned_after_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path(), false);
        settings.config.shutdown.grace_period_secs = 0;
        let sup = Supervisor::new(
            settings,
            PrometheusBuilder::new().build_recorder().handle(),
            TraceSink::new(),
        );
        sup.start().await.unwrap();
        sup.spawn("stuck", async {
            std::future::pending::<()>().await;
            Ok::<(), String>(())
        });

        let report = sup.shutdown(ExitCode::SUCCESS, "test").await;
        assert!(report.abandoned_tasks >= 1);
        assert_eq!(sup.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_stop_trace_before_shutdown_is_not_a_double_close() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), true);
        sup.start().await.unwrap();

        sup.stop_trace().await;
        assert!(!sup.trace_active());
        sup.stop_trace().await;

        sup.shutdown(ExitCode::SUCCESS, "system signal: SIGTERM").await;
        assert_eq!(trace_stop_records(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_start_still_closes_trace() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), true);

        let (started, report) = tokio::join!(
            sup.start(),
            sup.shutdown(ExitCode::SUCCESS, "system signal: SIGTERM")
        );
        started.unwrap();
        assert_eq!(report.code, ExitCode::SUCCESS);

        assert_eq!(sup.state(), LifecycleState::Terminated);
        assert!(!sup.trace_active());
        let len = std::fs::metadata(dir.path().join(TRACE_FILE_NAME)).unwrap().len();
        assert!(len > 0);
        assert_eq!(trace_stop_records(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_start_after_shutdown_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), true);
        sup.shutdown(ExitCode::SUCCESS, "test").await;

        let err = sup.start().await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::AlreadyStarted(LifecycleState::Terminated)
        ));
        assert!(!dir.path().join(TRACE_FILE_NAME).exists());
    }
}
