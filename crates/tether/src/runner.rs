//! Spawns cancellable units of work and funnels their completions into one inbox
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::systems::CancelFn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// How a unit of work ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Finished(T),
    TimedOut(Duration),
    Cancelled,
}

/// Cancels one spawned unit. Cancelling twice, or after completion, does nothing.
#[derive(Clone)]
pub struct TaskHandle {
    id: UnitId,
    cancel: CancelFn,
}

impl TaskHandle {
    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn cancel(&self) {
        (self.cancel)()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

/// Runs units of work on the tokio runtime
///
/// Each spawned unit posts exactly one message into the inbox, built by the
/// unit's wrapper from its [`Outcome`].
pub struct TaskRunner<M> {
    inbox: mpsc::UnboundedSender<M>,
    next_id: AtomicU64,
}

impl<M: Send + 'static> TaskRunner<M> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inbox: tx,
                next_id: AtomicU64::new(1),
            },
            rx,
        )
    }

    /// A sender for messages that do not come from spawned units
    pub fn sender(&self) -> mpsc::UnboundedSender<M> {
        self.inbox.clone()
    }

    pub fn spawn<T, Fut, W>(&self, deadline: Option<Duration>, work: Fut, wrap: W) -> TaskHandle
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        W: FnOnce(UnitId, Outcome<T>) -> M + Send + 'static,
    {
        let id = UnitId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let notify = Arc::new(Notify::new());
        let inbox = self.inbox.clone();

        let cancelled = notify.clone();
        tokio::spawn(async move {
            let run = async {
                match deadline {
                    Some(limit) => match tokio::time::timeout(limit, work).await {
                        Ok(value) => Outcome::Finished(value),
                        Err(_) => Outcome::TimedOut(limit),
                    },
                    None => Outcome::Finished(work.await),
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = cancelled.notified() => Outcome::Cancelled,
                outcome = run => outcome,
            };

            if inbox.send(wrap(id, outcome)).is_err() {
                debug!(unit = %id, "inbox closed, dropping completion");
            }
        });

        // notify_one stores a permit, so a cancel issued before the task first polls is not lost
        let cancel: CancelFn = Arc::new(move || notify.notify_one());
        TaskHandle { id, cancel }
    }
}
