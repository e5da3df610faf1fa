//! Graceful shutdown coordination via `CancellationToken`.
//!
//! Long-lived tasks (socket sessions, tunnels) are spawned on the
//! coordinator's [`TaskTracker`] and observe its token, usually through a
//! child token. Shutdown cancels the token and then waits, bounded, for the
//! tracked tasks to finish.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tokio_util::task::task_tracker::TrackedFuture;
use tracing::{info, warn};

/// Coordinates graceful shutdown across all server tasks.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the process cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a task that shutdown will wait for.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Wrap a future that runs on someone else's task so shutdown waits
    /// for it too.
    pub fn track<F: Future>(&self, future: F) -> TrackedFuture<F> {
        self.tracker.track_future(future)
    }

    /// Number of tracked tasks still running.
    pub fn task_count(&self) -> usize {
        self.tracker.len()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token and wait up to `timeout` for tracked tasks.
    ///
    /// Returns `true` if every task finished in time.
    pub async fn graceful_shutdown(&self, timeout: Duration) -> bool {
        self.shutdown();
        let _ = self.tracker.close();
        info!(
            task_count = self.tracker.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for tasks to complete"
        );
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(
                remaining = self.tracker.len(),
                "shutdown timed out after {timeout:?}, some tasks may still be running"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_not_shutting_down() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
    }

    #[test]
    fn token_propagation_and_idempotence() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let child = token.child_token();
        coord.shutdown();
        coord.shutdown();
        assert!(token.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_waits_for_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let _ = coord.spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        assert_eq!(coord.task_count(), 1);
        assert!(coord.graceful_shutdown(Duration::from_secs(5)).await);
        assert_eq!(coord.task_count(), 0);
    }

    #[tokio::test]
    async fn tracked_future_counts() {
        let coord = ShutdownCoordinator::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let fut = coord.track(async move {
            let _ = rx.await;
        });
        assert_eq!(coord.task_count(), 1);
        let handle = tokio::spawn(fut);
        let _ = tx.send(());
        handle.await.unwrap();
        assert_eq!(coord.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_times_out_on_stuck_task() {
        let coord = ShutdownCoordinator::new();
        let _ = coord.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert!(!coord.graceful_shutdown(Duration::from_secs(1)).await);
        assert!(coord.is_shutting_down());
    }

    #[tokio::test]
    async fn graceful_with_no_tasks() {
        let coord = ShutdownCoordinator::new();
        assert!(coord.graceful_shutdown(Duration::from_millis(10)).await);
    }
}
