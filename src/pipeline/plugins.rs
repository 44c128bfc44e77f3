//! The plugin contracts a pipeline is assembled from.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::buffer::Buffer;
use crate::model::Record;

/// A producer of records.
///
/// A source manages its own tasks: `start` hands it the buffer it writes into and returns once
/// it is running.
#[async_trait]
pub trait Source: Send + Sync {
    /// Start writing records into the given buffer.
    async fn start(&self, buffer: Arc<dyn Buffer>) -> Result<()>;

    /// Stop admitting new records. Must be idempotent.
    async fn stop(&self);
}

/// A transformation stage applied to batches of records.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Transform a batch of records.
    ///
    /// While a pipeline is draining this may be called with an empty batch, so that processors
    /// holding state can flush it.
    async fn execute(&self, records: Vec<Record>) -> Result<Vec<Record>>;

    /// Signal that the pipeline is shutting down and no new records will be read.
    fn prepare_for_shutdown(&self) {}

    /// Check if this processor has flushed everything it holds.
    fn is_ready_for_shutdown(&self) -> bool {
        true
    }

    /// Release all resources held by this processor.
    async fn shutdown(&self) {}

    /// The attributes identifying the group each event belongs to.
    ///
    /// A processor returning keys requires all events of a group to be processed on the same
    /// node, and is wrapped for peer forwarding when that is enabled.
    fn identification_keys(&self) -> Option<Vec<String>> {
        None
    }

    /// Check if this processor must be invoked even when no records were read.
    ///
    /// Such processors receive records from elsewhere than the pipeline's buffer.
    fn process_empty_batches(&self) -> bool {
        false
    }
}

/// A destination for records.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Output a batch of records.
    async fn output(&self, records: Vec<Record>) -> Result<()>;

    /// Release all resources held by this sink.
    async fn shutdown(&self) {}

    /// Check if this sink is ready to receive records.
    fn is_ready(&self) -> bool {
        true
    }
}
