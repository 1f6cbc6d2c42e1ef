//! Background Rebuild Pool
//!
//! Fixed-size worker pool fed through a bounded channel. Dispatch never
//! blocks the caller: a full backlog skips the rebuild (a later stale read
//! triggers it again), and a key already queued or running in this process
//! is not dispatched twice.
//!
//! A job that panics is contained to its own task and frees its key. This
//! relies on unwinding: release builds use `panic = "abort"`, where a
//! panicking loader takes the process down instead.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

/// Outcome of [`RebuildPool::try_dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Accepted into the backlog
    Queued,
    /// Same key already queued or running
    InFlight,
    /// Backlog full, rebuild skipped
    Saturated,
    /// Pool shut down
    Closed,
}

struct Task {
    key: String,
    job: BoxFuture<'static, ()>,
}

/// Removes the key from the in-flight set however the job ends.
struct InFlightGuard {
    in_flight: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Fixed-size pool running cache rebuilds.
pub struct RebuildPool {
    tx: mpsc::Sender<Task>,
    in_flight: Arc<DashMap<String, ()>>,
    workers: usize,
}

impl std::fmt::Debug for RebuildPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebuildPool")
            .field("workers", &self.workers)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl RebuildPool {
    /// Spawn `workers` tasks on the current Tokio runtime.
    pub fn new(workers: usize, backlog: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Task>(backlog.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let in_flight: Arc<DashMap<String, ()>> = Arc::new(DashMap::new());

        for worker in 0..workers {
            let rx = rx.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(task) = task else {
                        debug!(worker, "Rebuild worker exiting");
                        break;
                    };
                    let _guard = InFlightGuard {
                        in_flight: in_flight.clone(),
                        key: task.key.clone(),
                    };
                    if let Err(e) = tokio::spawn(task.job).await {
                        error!(key = %task.key, error = %e, "Cache rebuild panicked");
                    }
                }
            });
        }

        Self {
            tx,
            in_flight,
            workers,
        }
    }

    /// Queue `job` as the rebuild of `key` without waiting.
    pub fn try_dispatch<F>(&self, key: &str, job: F) -> Dispatch
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(_) => return Dispatch::InFlight,
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let task = Task {
            key: key.to_string(),
            job: Box::pin(job),
        };
        match self.tx.try_send(task) {
            Ok(()) => Dispatch::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.in_flight.remove(key);
                Dispatch::Saturated
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.in_flight.remove(key);
                Dispatch::Closed
            }
        }
    }

    /// Rebuilds queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Wait until no rebuild is queued or running.
    pub async fn wait_idle(&self) {
        while !self.in_flight.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
