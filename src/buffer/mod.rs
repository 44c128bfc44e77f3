//! Bounded, backpressured buffers with checkpoint-based acknowledgement.
//!
//! A buffer sits between a producer (a source, a pipeline connector, or the peer forwarding
//! service) and a pipeline's processing workers. Capacity taken by a write is only released once
//! the reader has checkpointed the batch in which the record was read, so the sum of queued and
//! checked-out records never exceeds the configured capacity.

mod bounded;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Record;

pub use bounded::BoundedBuffer;

pub(crate) const METRIC_RECORDS_WRITTEN: &str = "hadron_flow_buffer_records_written";
pub(crate) const METRIC_RECORDS_READ: &str = "hadron_flow_buffer_records_read";
pub(crate) const METRIC_WRITE_TIMEOUTS: &str = "hadron_flow_buffer_write_timeouts";
pub(crate) const METRIC_WRITE_OVERFLOWS: &str = "hadron_flow_buffer_write_overflows";
pub(crate) const METRIC_RECORDS_IN_FLIGHT: &str = "hadron_flow_buffer_records_in_flight";
pub(crate) const METRIC_USAGE: &str = "hadron_flow_buffer_usage";

/// The staging area between a producer and a pipeline's processing stage.
#[async_trait]
pub trait Buffer: Send + Sync {
    /// Write a single record, waiting at most `timeout` for capacity to become free.
    async fn write(&self, record: Record, timeout: Duration) -> WriteOutcome;

    /// Write all of the given records, or none of them.
    ///
    /// A batch which could never fit returns `TooLarge` without waiting. Otherwise this waits at
    /// most `timeout` for enough capacity to admit the entire batch at once.
    async fn write_all(&self, records: Vec<Record>, timeout: Duration) -> WriteOutcome;

    /// Read up to one batch of records collected within `timeout`.
    ///
    /// The capacity of the returned records stays reserved until the returned state is passed to
    /// `checkpoint`.
    async fn read(&self, timeout: Duration) -> (Vec<Record>, CheckpointState);

    /// Acknowledge a previously read batch, releasing its reserved capacity.
    fn checkpoint(&self, state: CheckpointState) -> Result<(), CheckpointError>;

    /// True only when nothing is queued and nothing is checked out.
    fn is_empty(&self) -> bool;
}

/// The outcome of a buffer write.
///
/// Rejected records are handed back so that the caller can decide to retry, drop or propagate.
#[must_use]
#[derive(Debug)]
pub enum WriteOutcome {
    /// All records were admitted.
    Admitted,
    /// Capacity did not become free within the timeout; nothing was admitted.
    TimedOut(Vec<Record>),
    /// The batch is larger than the buffer's total capacity and can never be admitted as a whole.
    TooLarge(Vec<Record>),
}

impl WriteOutcome {
    /// Check if the write was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// A token for a batch of records read from a buffer but not yet acknowledged.
///
/// Not `Clone`: each state is consumed by exactly one checkpoint.
#[derive(Debug, PartialEq, Eq)]
pub struct CheckpointState {
    buffer_id: u64,
    count: usize,
}

impl CheckpointState {
    pub(crate) fn new(buffer_id: u64, count: usize) -> Self {
        Self { buffer_id, count }
    }

    /// The number of records covered by this state.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Errors from checkpointing a buffer.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The state was produced by a different buffer instance; the state is handed back.
    #[error("checkpoint state belongs to buffer {} but was checkpointed against buffer {buffer_id}", .state.buffer_id)]
    ForeignBuffer { state: CheckpointState, buffer_id: u64 },
    /// The state claims more records than are currently checked out.
    #[error("checkpoint of {count} records exceeds the {in_flight} records checked out")]
    Overcount { count: usize, in_flight: usize },
}
