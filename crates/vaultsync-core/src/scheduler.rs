//! Periodic sweep scheduler.
//!
//! Runs a tick callback on a fixed interval as a correctness backstop for
//! missed file-system events. The handle is owned by the engine's active
//! connection; `stop()` (or drop) aborts the task so a tick can never fire
//! against a torn-down connection.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Owned handle to the periodic tick task.
pub struct SyncScheduler {
    task: JoinHandle<()>,
}

impl SyncScheduler {
    /// Spawn a task that invokes `tick` every `every`.
    ///
    /// The first interval tick is consumed up front so the first sweep runs
    /// one full period after start (the connect-time reconciliation already
    /// covers the present state).
    pub fn start<Mk, Fut>(every: Duration, mut tick: Mk) -> Self
    where
        Mk: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        Self { task }
    }

    /// Cancel the periodic task.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}
