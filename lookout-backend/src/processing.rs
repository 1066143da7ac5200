//! Background work off the request path.
//!
//! Critical work is tracked and drained on shutdown. Non-critical work runs
//! under a fixed number of permits and is dropped when none are free.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub struct Processing {
    critical: Mutex<JoinSet<()>>,
    permits: Arc<Semaphore>,
}

impl Processing {
    pub fn new(non_critical_limit: usize) -> Self {
        Self {
            critical: Mutex::new(JoinSet::new()),
            permits: Arc::new(Semaphore::new(non_critical_limit.max(1))),
        }
    }

    /// Run work that must finish for stored data to be correct.
    pub fn critical<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.critical.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished work so the set does not grow without bound
        while set.try_join_next().is_some() {}
        set.spawn(work);
    }

    /// Run work that may be skipped under load. Returns false if it was dropped.
    pub fn non_critical<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    work.await;
                    drop(permit);
                });
                true
            }
            Err(_) => {
                debug!("dropping non-critical work, all permits in use");
                false
            }
        }
    }

    /// Wait for critical work, up to `timeout`; whatever is left after that is aborted.
    /// Returns the number of tasks that had to be aborted.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let mut set = std::mem::take(
            &mut *self.critical.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Err(e))) => warn!(error = %e, "critical task failed"),
                Ok(Some(Ok(()))) => {}
                Ok(None) => return 0,
                Err(_) => {
                    let left = set.len();
                    warn!(left, "critical work did not finish in time, aborting");
                    set.abort_all();
                    return left;
                }
            }
        }
    }
}
