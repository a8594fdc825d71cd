use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Minimum spacing between two dispatches.
    #[serde(with = "crate::utils::serde_duration::millis", alias = "min_interval_ms")]
    pub min_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }
}

/// Serializes calls: one at a time, in submission order, spaced by `min_interval`.
///
/// The lock is a FIFO-fair `tokio::sync::Mutex`, so waiters are served in the order
/// they called [`enqueue`](Self::enqueue). A call submitted while another is running
/// simply waits its turn; there is no separate drain task.
pub struct RequestQueue {
    cfg: QueueConfig,
    last_dispatch: Mutex<Option<Instant>>,
    waiting: AtomicUsize,
}

impl RequestQueue {
    pub fn new(cfg: QueueConfig) -> Self {
        Self {
            cfg,
            last_dispatch: Mutex::new(None),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    /// Number of calls queued or running.
    pub fn len(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` once every earlier submission has finished and the spacing has elapsed.
    ///
    /// Dropping the returned future before dispatch removes the call from the queue.
    pub async fn enqueue<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _pending = Pending::new(&self.waiting);
        let mut last = self.last_dispatch.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.cfg.min_interval;
            if ready_at > Instant::now() {
                trace!(
                    wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "queue spacing"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
        f().await
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

struct Pending<'a>(&'a AtomicUsize);

impl<'a> Pending<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
