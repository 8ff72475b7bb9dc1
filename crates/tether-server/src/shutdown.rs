//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default timeout for graceful shutdown before aborting tasks.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// A background task the server waits on at shutdown.
pub struct ServerTask {
    /// Name used in shutdown logs.
    pub name: &'static str,
    /// The running task.
    pub handle: JoinHandle<()>,
}

impl ServerTask {
    /// Track `handle` under `name`.
    pub fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }
}

/// Coordinates shutdown of the listener, background sweeps and sessions.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token and wait up to `timeout` for every task. Returns the
    /// names of tasks that had to be aborted.
    pub async fn graceful_shutdown(
        &self,
        tasks: Vec<ServerTask>,
        timeout: Option<Duration>,
    ) -> Vec<&'static str> {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        info!(
            task_count = tasks.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let deadline = tokio::time::Instant::now() + timeout;
        let mut aborted = Vec::new();
        for task in tasks {
            let abort = task.handle.abort_handle();
            if tokio::time::timeout_at(deadline, task.handle).await.is_err() {
                warn!(task = task.name, "task still running after {timeout:?}, aborting");
                abort.abort();
                aborted.push(task.name);
            }
        }
        aborted
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
