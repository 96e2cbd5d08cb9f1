//! Management of long-running background jobs (the transport receive loop).
//!
//! A session's host-facing API is synchronous; the only place the library
//! awaits is inside jobs owned by this manager. Jobs receive a cancellation
//! signal through a watch channel and are expected to return soon after it
//! flips. Errors a job observes are latched inside the job's own state (see
//! [`TokioUdpSocket::take_error`]) and surface synchronously on the next
//! host call.
//!
//! [`TokioUdpSocket::take_error`]: crate::TokioUdpSocket

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use web_time::Duration;

/// Owns the background tasks that drive a session's transport and their
/// cooperative shutdown.
///
/// ```ignore
/// let (socket, task) = TokioUdpSocket::bind("0.0.0.0:7000").await?;
/// let mut jobs = BackgroundJobManager::new();
/// jobs.spawn(|shutdown| task.run(shutdown));
/// // ... run the session ...
/// jobs.stop(Duration::from_secs(1)).await;
/// ```
pub struct BackgroundJobManager {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for BackgroundJobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundJobManager {
    /// Creates a manager with no jobs.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    /// Spawns a job onto the current tokio runtime. The job receives the
    /// manager's cancellation signal and must return soon after it flips to
    /// `true`.
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime (`tokio::spawn` semantics).
    pub fn spawn<F, Fut>(&mut self, job: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(job(self.shutdown_rx.clone()));
        self.handles.push(handle);
    }

    /// The number of jobs spawned and not yet stopped.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.handles.len()
    }

    /// Signals cancellation and waits up to `grace` for every job to
    /// finish; jobs still running afterwards are aborted. Returns `true`
    /// if all jobs stopped within the grace period.
    pub async fn stop(mut self, grace: Duration) -> bool {
        debug!("stopping {} background job(s)", self.handles.len());
        // receivers see the change at their next await point
        let _ = self.shutdown_tx.send(true);

        let mut all_stopped = true;
        for mut handle in self.handles.drain(..) {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => (),
                Ok(Err(e)) if e.is_cancelled() => (),
                Ok(Err(e)) => warn!("background job panicked: {}", e),
                Err(_) => {
                    warn!("background job ignored cancellation, aborting it");
                    handle.abort();
                    all_stopped = false;
                },
            }
        }
        all_stopped
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jobs_stop_on_cancellation() {
        let mut manager = BackgroundJobManager::new();
        manager.spawn(|mut shutdown| async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        });
        assert_eq!(manager.job_count(), 1);
        assert!(manager.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_stuck_job_reported() {
        let mut manager = BackgroundJobManager::new();
        manager.spawn(|_shutdown| async move {
            // ignores cancellation on purpose
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
        assert!(!manager.stop(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_finished_job_is_fine() {
        let mut manager = BackgroundJobManager::new();
        manager.spawn(|_shutdown| async move {});
        tokio::task::yield_now().await;
        assert!(manager.stop(Duration::from_millis(100)).await);
    }
}
