use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::AppError;

/// A bounded set of tokio tasks which can be shut down and awaited as a unit.
///
/// At most `size` tasks of the pool run concurrently; tasks spawned beyond that wait for a slot.
pub struct TaskPool {
    name: &'static str,
    slots: Arc<Semaphore>,
    /// The number of spawned tasks which have not yet finished, waiting ones included.
    outstanding: Arc<AtomicUsize>,
    /// Signalled whenever `outstanding` drops to 0.
    idle: Arc<Notify>,
    handles: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
}

impl TaskPool {
    /// Create a new instance.
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            slots: Arc::new(Semaphore::new(size.max(1))),
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The number of tasks which have not yet finished.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Check if this pool has stopped accepting tasks.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawn a task onto this pool.
    pub fn spawn<F>(&self, fut: F) -> Result<JoinHandle<F::Output>, AppError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_closed() {
            return Err(AppError::PoolClosed(self.name));
        }
        let guard = OutstandingGuard::new(self.outstanding.clone(), self.idle.clone());
        let slots = self.slots.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            // The semaphore is never closed.
            let _permit = slots.acquire_owned().await.ok();
            fut.await
        });

        let mut handles = self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle.abort_handle());
        Ok(handle)
    }

    /// Stop accepting new tasks. Tasks already spawned keep running.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Wait up to `timeout` for every task of this pool to finish, aborting the rest on timeout.
    ///
    /// Returns `true` if all tasks finished on their own.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let all_finished = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.outstanding() == 0 {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(timeout, all_finished).await.is_ok() {
            return true;
        }

        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        tracing::warn!(pool = self.name, outstanding = self.outstanding(), "task pool did not terminate within {:?}, aborting tasks", timeout);
        handles.iter().for_each(|handle| handle.abort());
        false
    }
}

/// Tracks one outstanding task, also when the task is aborted.
struct OutstandingGuard {
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl OutstandingGuard {
    fn new(outstanding: Arc<AtomicUsize>, idle: Arc<Notify>) -> Self {
        outstanding.fetch_add(1, Ordering::AcqRel);
        Self { outstanding, idle }
    }
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}
