//! Shutdown coordination primitives: exit codes, the internal exit channel,
//! and the task group every background task is launched under.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Process exit status. A `u8` keeps it inside `[0, 255]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitCode(u8);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);

    pub fn code(self) -> u8 {
        self.0
    }
}

impl From<u8> for ExitCode {
    fn from(code: u8) -> Self {
        Self(code)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reason used when internal code asks for an exit without giving one.
pub const STARTUP_ERROR_REASON: &str = "startup error";

/// An exit requested from inside the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRequest {
    pub code: ExitCode,
    pub reason: String,
}

const EXIT_CHANNEL_CAPACITY: usize = 8;

/// Create the internal exit channel. The receiver belongs to the signal listener.
pub fn exit_channel() -> (ExitSender, mpsc::Receiver<ExitRequest>) {
    let (tx, rx) = mpsc::channel(EXIT_CHANNEL_CAPACITY);
    (ExitSender { tx }, rx)
}

/// Cloneable handle internal code uses to request process exit.
#[derive(Debug, Clone)]
pub struct ExitSender {
    tx: mpsc::Sender<ExitRequest>,
}

impl ExitSender {
    /// Request an exit with the default "startup error" reason.
    pub fn exit(&self, code: ExitCode) -> bool {
        self.exit_with(code, STARTUP_ERROR_REASON)
    }

    /// Request an exit. Returns `false` when the request was not queued,
    /// either because a trigger was already consumed or the queue is full
    /// of pending requests. Never blocks.
    pub fn exit_with(&self, code: ExitCode, reason: impl Into<String>) -> bool {
        let request = ExitRequest {
            code,
            reason: reason.into(),
        };
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(req)) => {
                tracing::debug!(code = %req.code, "exit request dropped, queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(req)) => {
                tracing::debug!(code = %req.code, "exit request dropped, listener finished");
                false
            }
        }
    }
}

/// A task in the group that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task} failed: {message}")]
pub struct TaskError {
    pub task: String,
    pub message: String,
}

/// Result of joining the task group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub first_error: Option<TaskError>,
    /// Tasks still running when the grace period ran out.
    pub abandoned: usize,
}

/// Tracks background tasks and the first error among them.
///
/// The first failing task cancels the group token (and with it every token
/// handed out by [`TaskGroup::token`]) and submits an exit request with
/// [`ExitCode::FAILURE`].
#[derive(Clone)]
pub struct TaskGroup {
    tracker: TaskTracker,
    token: CancellationToken,
    first_error: Arc<Mutex<Option<TaskError>>>,
    exit: ExitSender,
}

impl TaskGroup {
    pub fn new(parent: &CancellationToken, exit: ExitSender) -> Self {
        Self {
            tracker: TaskTracker::new(),
            token: parent.child_token(),
            first_error: Arc::new(Mutex::new(None)),
            exit,
        }
    }

    /// A token cancelled when the group or any of its ancestors is.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    pub fn first_error(&self) -> Option<TaskError> {
        self.first_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Launch `fut` as a member of the group.
    pub fn spawn<F, E>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let group = self.clone();
        self.tracker.spawn(async move {
            match handle.await {
                Ok(Ok(())) => tracing::debug!(task = name, "task finished"),
                Ok(Err(e)) => group.fail(name, e.to_string()),
                Err(join_err) if join_err.is_panic() => group.fail(name, "panicked".to_string()),
                Err(_) => tracing::debug!(task = name, "task aborted"),
            }
        });
    }

    fn fail(&self, task: &str, message: String) {
        let error = TaskError {
            task: task.to_string(),
            message,
        };
        tracing::error!(task, error = %error.message, "background task failed");

        {
            let mut first = self.first_error.lock().unwrap_or_else(|p| p.into_inner());
            if first.is_none() {
                *first = Some(error.clone());
            }
        }

        self.token.cancel();
        self.exit.exit_with(ExitCode::FAILURE, error.to_string());
    }

    /// Wait for every task to finish, giving up after `grace`.
    pub async fn wait(&self, grace: Duration) -> JoinOutcome {
        self.tracker.close();
        let abandoned = match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => 0,
            Err(_) => {
                let remaining = self.len();
                tracing::warn!(
                    remaining,
                    grace_secs = grace.as_secs_f64(),
                    "grace period expired, abandoning background tasks"
                );
                remaining
            }
        };

        JoinOutcome {
            first_error: self.first_error(),
            abandoned,
        }
    }
}
