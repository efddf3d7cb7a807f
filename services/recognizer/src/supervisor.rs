//! Restart-with-delay supervision for the long-running loops.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How long to wait before running a supervised task again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay after the task returned `Ok`
    pub after_success: Duration,
    /// Delay after the task returned `Err`
    pub after_failure: Duration,
}

impl RestartPolicy {
    /// Same delay whatever the outcome.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            after_success: delay,
            after_failure: delay,
        }
    }
}

/// Run `task` immediately and keep re-running it according to `policy` until
/// `cancel` fires. Errors are logged, never propagated.
pub async fn supervise<F, Fut, E>(
    name: &'static str,
    policy: RestartPolicy,
    cancel: CancellationToken,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    info!(task = name, "Supervised task started");

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = task() => outcome,
        };

        let delay = match outcome {
            Ok(()) => {
                debug!(task = name, next_run_secs = policy.after_success.as_secs(), "Task run completed");
                policy.after_success
            }
            Err(e) => {
                error!(
                    task = name,
                    error = %e,
                    retry_in_secs = policy.after_failure.as_secs(),
                    "Task failed, scheduling restart"
                );
                metrics::counter!("supervisor.restarts", "task" => name).increment(1);
                policy.after_failure
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(task = name, "Supervised task stopped");
}
