mod config;
mod exporter;
mod metrics;
mod profiling;
mod shutdown;
mod signals;
mod supervisor;
mod trace;
mod version;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{Settings, DEFAULT_PPROF_PORT};
use crate::shutdown::ExitCode;
use crate::supervisor::{Supervisor, SupervisorError};
use crate::trace::TraceSink;
use crate::version::BuildInfo;

/// Esmeralda is a Full Stack Distributed Tracing Monitoring System Server.
#[derive(Parser, Debug)]
#[command(name = "esmeralda", about)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file path [default: /etc/chuanyun/esmeralda.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Turn on profiling
    #[arg(long, global = true)]
    pprof: bool,

    /// Port for the profiling listener
    #[arg(long = "pprof.port", global = true, default_value_t = DEFAULT_PPROF_PORT)]
    pprof_port: u16,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the release software version info
    Version,
}

fn init_tracing(trace_sink: &TraceSink) {
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("esmeralda=info")),
        );
    let trace = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(trace_sink.clone())
        .with_filter(trace_sink.capture_filter());

    tracing_subscriber::registry().with(console).with(trace).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let argv0 = std::env::args().next();
    let build = BuildInfo::from_argv0(argv0.as_deref());

    if matches!(cli.command, Some(Command::Version)) {
        println!("{}", build.banner());
        std::process::exit(0);
    }

    let trace_sink = TraceSink::new();
    init_tracing(&trace_sink);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match config::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(i32::from(ExitCode::FAILURE.code()));
        }
    };

    let metrics = match metrics::setup_metrics_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to install metrics recorder");
            std::process::exit(i32::from(ExitCode::FAILURE.code()));
        }
    };

    let settings = Settings::new(config, build).with_pprof(cli.pprof, cli.pprof_port);
    let supervisor = Supervisor::new(settings, metrics, trace_sink);

    if let Err(e) = supervisor.start().await {
        tracing::error!(error = %e, "startup failed");
        // Without signal handlers there is no listener to consume the request.
        let queued = !matches!(e, SupervisorError::Signal(_))
            && supervisor.exit_sender().exit(ExitCode::FAILURE);
        if !queued {
            supervisor
                .shutdown(ExitCode::FAILURE, format!("startup error: {e}"))
                .await;
        }
    } else {
        tracing::info!(
            exporter = ?supervisor.exporter_addr(),
            profiling = ?supervisor.diagnostics_addr(),
            "listeners ready"
        );
    }

    let report = supervisor.wait().await;
    std::process::exit(i32::from(report.code.code()));
}
