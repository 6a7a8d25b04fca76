//! One-shot recheck timers keyed by user.
//!
//! Each user has at most one pending recheck. Scheduling again replaces the
//! old timer; `cancel` aborts it. The job itself still has to confirm the
//! window is current when it fires, since a stop can race the timer.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

struct Scheduled {
    id: u64,
    handle: AbortHandle,
}

#[derive(Clone)]
pub struct RecheckScheduler {
    delay: Duration,
    tasks: Arc<DashMap<String, Scheduled>>,
    next_id: Arc<AtomicU64>,
}

impl RecheckScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            tasks: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Run `job` once after the configured delay, replacing any recheck
    /// already pending for the user.
    pub fn schedule<F>(&self, user_id: &str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();
        let key = user_id.to_string();
        let delay = self.delay;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Only clear our own entry; a newer schedule may have replaced it.
            tasks.remove_if(&key, |_, s| s.id == id);
            job.await;
        })
        .abort_handle();

        let entry = Scheduled { id, handle };
        if let Some(old) = self.tasks.insert(user_id.to_string(), entry) {
            old.handle.abort();
        }
        debug!(
            user_id = user_id,
            delay_secs = delay.as_secs(),
            "recheck scheduled"
        );
    }

    /// Abort the user's pending recheck. Returns true if one was pending.
    pub fn cancel(&self, user_id: &str) -> bool {
        match self.tasks.remove(user_id) {
            Some((_, s)) => {
                s.handle.abort();
                debug!(user_id = user_id, "recheck cancelled");
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }
}
