//! Termination trigger sources.
//!
//! SIGINT and SIGTERM start shutdown; SIGHUP is received and ignored so it
//! cannot kill the process. SIGKILL is part of the termination set in name
//! only: the kernel never delivers it to a handler.
//! Internal code asks for an exit through the [`ExitSender`](crate::shutdown::ExitSender)
//! channel instead.

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::shutdown::{ExitCode, ExitRequest};

pub const TERMINATION_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];
pub const IGNORED_SIGNALS: [Signal; 1] = [Signal::SIGHUP];

/// The event that starts shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    OsSignal(Signal),
    InternalExit(ExitRequest),
}

impl Trigger {
    /// Exit code the process should end with. Signals are a normal stop.
    pub fn code(&self) -> ExitCode {
        match self {
            Trigger::OsSignal(_) => ExitCode::SUCCESS,
            Trigger::InternalExit(req) => req.code,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Trigger::OsSignal(sig) => format!("system signal: {}", sig.as_str()),
            Trigger::InternalExit(req) => req.reason.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to install handler for {}: {source}", signal.as_str())]
pub struct SignalError {
    pub signal: Signal,
    pub source: std::io::Error,
}

fn install(sig: Signal) -> Result<tokio::signal::unix::Signal, SignalError> {
    signal(SignalKind::from_raw(sig as i32)).map_err(|source| SignalError {
        signal: sig,
        source,
    })
}

/// Registered OS signal streams.
///
/// Registration happens in [`SignalSet::install`], so once it returns the
/// process no longer dies from any of the handled signals.
pub struct SignalSet {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

impl SignalSet {
    pub fn install() -> Result<Self, SignalError> {
        let [interrupt, terminate] = TERMINATION_SIGNALS;
        let [hangup] = IGNORED_SIGNALS;
        Ok(Self {
            interrupt: install(interrupt)?,
            terminate: install(terminate)?,
            hangup: install(hangup)?,
        })
    }
}

/// Wait for the first termination trigger from either source.
///
/// Ignored signals are drained and logged while waiting. A closed exit
/// channel leaves only the signal source armed.
pub async fn next_trigger(
    signals: &mut SignalSet,
    exits: &mut mpsc::Receiver<ExitRequest>,
) -> Trigger {
    loop {
        tokio::select! {
            Some(()) = signals.interrupt.recv() => return Trigger::OsSignal(Signal::SIGINT),
            Some(()) = signals.terminate.recv() => return Trigger::OsSignal(Signal::SIGTERM),
            Some(req) = exits.recv() => return Trigger::InternalExit(req),
            Some(()) = signals.hangup.recv() => {
                tracing::debug!(signal = Signal::SIGHUP.as_str(), "ignoring signal");
            }
            else => std::future::pending::<()>().await,
        }
    }
}
