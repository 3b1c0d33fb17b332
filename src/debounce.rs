// src/debounce.rs

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug)]
struct PendingJob {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Trailing-edge debouncer: only the last job scheduled within `delay` runs.
///
/// A job can be cancelled while it is still waiting out the delay. Once it
/// has started it always runs to completion, so a write is never cut off
/// halfway.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<PendingJob>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Run `job` after `delay`, replacing any job still waiting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return,
            }
            job().await;
        });

        let next = PendingJob { handle, cancel };
        if let Some(previous) = self.pending.lock().replace(next) {
            trace!("Replacing pending debounced job");
            previous.cancel.cancel();
        }
    }

    /// Cancel the pending job and wait for it to settle. A job that already
    /// started is waited for rather than interrupted.
    ///
    /// Returns `true` if a job had not yet finished.
    pub async fn cancel_and_wait(&self) -> bool {
        let pending = self.pending.lock().take();
        let Some(pending) = pending else {
            return false;
        };
        let was_pending = !pending.handle.is_finished();
        pending.cancel.cancel();
        if let Err(e) = pending.handle.await {
            trace!(error = %e, "Debounced job ended abnormally");
        }
        was_pending
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|job| !job.handle.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(job) = self.pending.get_mut().take() {
            job.handle.abort();
        }
    }
}
