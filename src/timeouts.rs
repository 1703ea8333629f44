//! Shared deadline wheel for cheap per-operation timeouts.

use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;
use tracing::trace;

type Action = Box<dyn FnOnce() + Send>;

struct Entry {
    after: Duration,
    action: Action,
    cancelled: Arc<AtomicBool>,
}

/// Cancellation handle for one scheduled action.
///
/// Cancelling does not remove the entry from the wheel; the entry
/// expires silently instead. Handles are cheap to clone and drop.
#[derive(Clone)]
pub struct TimeoutRef {
    cancelled: Arc<AtomicBool>,
}

impl TimeoutRef {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// A single timer wheel shared by every connection of a client.
///
/// Each in-flight request registers a deadline action here (killing its
/// response slot), so deadlines cost one queue insertion instead of one
/// task. Actions run on the wheel's worker task and must not block.
pub struct TimeoutManager {
    tx: mpsc::UnboundedSender<Entry>,
    worker: JoinHandle<()>,
}

impl TimeoutManager {
    /// Spawns the wheel's worker task; must run inside a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(rx));
        TimeoutManager { tx, worker }
    }

    /// Schedules `action` to run once `after` has elapsed, unless the
    /// returned handle is cancelled first.
    pub fn schedule<F>(&self, after: Duration, action: F) -> TimeoutRef
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            after,
            action: Box::new(action),
            cancelled: cancelled.clone(),
        };
        if self.tx.send(entry).is_err() {
            // wheel already destroyed; the action will never fire,
            // which is indistinguishable from a cancelled deadline
            cancelled.store(true, Ordering::Release);
        }
        TimeoutRef { cancelled }
    }

    /// Stops the wheel. Pending actions never fire.
    pub fn destroy(&self) {
        self.worker.abort();
    }
}

impl Default for TimeoutManager {
    fn default() -> Self {
        TimeoutManager::new()
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Entry>) {
    let mut queue: DelayQueue<Entry> = DelayQueue::new();
    loop {
        // an empty queue yields Ready(None) from poll_expired, so only
        // wait on it while something is scheduled
        if queue.is_empty() {
            match rx.recv().await {
                Some(entry) => {
                    let after = entry.after;
                    queue.insert(entry, after);
                }
                None => return,
            }
            continue;
        }
        tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => {
                    let after = entry.after;
                    queue.insert(entry, after);
                }
                None => return,
            },
            expired = poll_fn(|cx| queue.poll_expired(cx)) => {
                if let Some(expired) = expired {
                    let entry = expired.into_inner();
                    if !entry.cancelled.load(Ordering::Acquire) {
                        trace!("deadline fired");
                        (entry.action)();
                    }
                }
            }
        }
    }
}
