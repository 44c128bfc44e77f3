use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

use crate::buffer::{
    Buffer, CheckpointError, CheckpointState, WriteOutcome, METRIC_RECORDS_IN_FLIGHT, METRIC_RECORDS_READ, METRIC_RECORDS_WRITTEN, METRIC_USAGE,
    METRIC_WRITE_OVERFLOWS, METRIC_WRITE_TIMEOUTS,
};
use crate::error::AppError;
use crate::model::Record;

/// Source of unique buffer IDs, used to reject checkpoint states from other buffers.
static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// An in-memory buffer with a fixed record capacity.
///
/// Capacity is tracked as semaphore permits. A write takes one permit per record and forgets
/// them; a checkpoint adds the permits of the acknowledged batch back. Permits are acquired in a
/// single call per batch, which makes batch admission all-or-nothing.
pub struct BoundedBuffer {
    id: u64,
    /// The name under which this buffer reports metrics.
    name: Arc<String>,
    capacity: usize,
    batch_size: usize,

    /// Free capacity.
    permits: Semaphore,
    /// Records written but not yet read.
    queue: Mutex<VecDeque<Record>>,
    /// Signalled whenever records are added to the queue.
    records_available: Notify,
    /// Records read but not yet checkpointed.
    ///
    /// Only incremented while the queue lock is held, so that `is_empty` never observes a record
    /// which is neither queued nor in flight.
    in_flight: AtomicUsize,
}

impl BoundedBuffer {
    /// Create a new instance.
    pub fn new(name: impl Into<String>, capacity: usize, batch_size: usize) -> Result<Self> {
        if capacity == 0 || batch_size == 0 {
            let msg = format!("buffer capacity ({}) and batch size ({}) must be greater than 0", capacity, batch_size);
            return Err(AppError::InvalidConfig(msg).into());
        }
        if capacity > Semaphore::MAX_PERMITS || capacity > u32::MAX as usize {
            return Err(AppError::InvalidConfig(format!("buffer capacity {} is too large", capacity)).into());
        }
        Ok(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::new(name.into()),
            capacity,
            batch_size,
            permits: Semaphore::new(capacity),
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            records_available: Notify::new(),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// The name of this buffer.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// The total number of records this buffer can hold, queued and in flight.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The max number of records returned from a single read.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The amount of capacity currently taken, queued and in flight.
    pub fn occupied(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// The number of records read but not yet checkpointed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The number of records queued for reading.
    pub fn queued(&self) -> usize {
        self.lock_queue().len()
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Record>> {
        // A panic while holding this lock can not leave the queue half-modified, so recover.
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move up to `max` queued records into `batch`, marking them as in flight.
    fn drain_into(&self, batch: &mut Vec<Record>, max: usize) -> usize {
        let mut queue = self.lock_queue();
        let count = max.min(queue.len());
        if count > 0 {
            batch.extend(queue.drain(..count));
            self.in_flight.fetch_add(count, Ordering::AcqRel);
        }
        count
    }

    fn report_usage(&self) {
        metrics::gauge!(METRIC_USAGE, "buffer" => self.name.to_string()).set(self.occupied() as f64 / self.capacity as f64);
        metrics::gauge!(METRIC_RECORDS_IN_FLIGHT, "buffer" => self.name.to_string()).set(self.in_flight() as f64);
    }
}

#[async_trait]
impl Buffer for BoundedBuffer {
    async fn write(&self, record: Record, timeout: Duration) -> WriteOutcome {
        self.write_all(vec![record], timeout).await
    }

    #[tracing::instrument(level = "trace", skip(self, records, timeout), fields(buffer = %self.name, count = records.len()))]
    async fn write_all(&self, records: Vec<Record>, timeout: Duration) -> WriteOutcome {
        let count = records.len();
        if count == 0 {
            return WriteOutcome::Admitted;
        }
        if count > self.capacity {
            metrics::counter!(METRIC_WRITE_OVERFLOWS, "buffer" => self.name.to_string()).increment(1);
            return WriteOutcome::TooLarge(records);
        }

        // The semaphore is never closed, so an acquisition error is treated like a timeout.
        match tokio::time::timeout(timeout, self.permits.acquire_many(count as u32)).await {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_)) | Err(_) => {
                metrics::counter!(METRIC_WRITE_TIMEOUTS, "buffer" => self.name.to_string()).increment(1);
                return WriteOutcome::TimedOut(records);
            }
        }

        self.lock_queue().extend(records);
        self.records_available.notify_waiters();
        metrics::counter!(METRIC_RECORDS_WRITTEN, "buffer" => self.name.to_string()).increment(count as u64);
        self.report_usage();
        WriteOutcome::Admitted
    }

    #[tracing::instrument(level = "trace", skip(self, timeout), fields(buffer = %self.name))]
    async fn read(&self, timeout: Duration) -> (Vec<Record>, CheckpointState) {
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::with_capacity(self.batch_size);
        loop {
            // Register interest before inspecting the queue, so a write landing in between is not missed.
            let notified = self.records_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = self.batch_size - batch.len();
            self.drain_into(&mut batch, remaining);
            if batch.len() >= self.batch_size {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        if !batch.is_empty() {
            metrics::counter!(METRIC_RECORDS_READ, "buffer" => self.name.to_string()).increment(batch.len() as u64);
            self.report_usage();
        }
        let state = CheckpointState::new(self.id, batch.len());
        (batch, state)
    }

    fn checkpoint(&self, state: CheckpointState) -> Result<(), CheckpointError> {
        if state.buffer_id != self.id {
            tracing::error!(buffer = %self.name, "checkpoint state from a different buffer rejected");
            return Err(CheckpointError::ForeignBuffer { state, buffer_id: self.id });
        }
        if state.count == 0 {
            return Ok(());
        }
        let res = self.in_flight.fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_flight| in_flight.checked_sub(state.count));
        if let Err(in_flight) = res {
            tracing::error!(buffer = %self.name, count = state.count, in_flight, "checkpoint exceeding in-flight records rejected");
            return Err(CheckpointError::Overcount { count: state.count, in_flight });
        }
        self.permits.add_permits(state.count);
        self.report_usage();
        Ok(())
    }

    fn is_empty(&self) -> bool {
        let queue = self.lock_queue();
        queue.is_empty() && self.in_flight.load(Ordering::Acquire) == 0
    }
}
