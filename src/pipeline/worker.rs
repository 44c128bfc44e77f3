use std::sync::Arc;

use anyhow::{Context, Result};

use crate::error::{ShutdownError, ShutdownResult};
use crate::model::Record;
use crate::pipeline::{Pipeline, Processor, METRIC_RECORDS_PROCESSED};

/// A processing worker of a pipeline.
///
/// Each worker runs its own processor lane: the shared processor of each `Shared` stage, and its
/// own instance of each `PerWorker` stage.
pub(super) struct Worker {
    id: usize,
    pipeline: Arc<Pipeline>,
    processors: Vec<Arc<dyn Processor>>,
}

impl Worker {
    pub(super) fn new(id: usize, pipeline: Arc<Pipeline>, processors: Vec<Arc<dyn Processor>>) -> Self {
        Self { id, pipeline, processors }
    }

    pub(super) async fn run(self) -> ShutdownResult<()> {
        tracing::debug!(pipeline = %self.pipeline.name(), worker = self.id, "pipeline worker has started");
        while !self.pipeline.is_stop_requested() {
            self.run_once(false).await.map_err(|source| self.shutdown_error(source))?;
        }

        // Keep going until the buffer is empty and every processor has flushed its state.
        loop {
            self.run_once(true).await.map_err(|source| self.shutdown_error(source))?;
            if self.pipeline.buffer().is_empty() && self.is_ready_for_shutdown() {
                break;
            }
        }
        tracing::debug!(pipeline = %self.pipeline.name(), worker = self.id, "pipeline worker has shut down");
        Ok(())
    }

    /// Read, process and publish one batch, then checkpoint it.
    ///
    /// The batch is checkpointed even if processing fails, so that the buffer's accounting stays
    /// consistent for the remaining workers.
    async fn run_once(&self, draining: bool) -> Result<()> {
        let buffer = self.pipeline.buffer();
        let (records, checkpoint) = buffer.read(self.pipeline.read_timeout()).await;
        let res = self.process(records, draining).await;
        let checkpointed = buffer.checkpoint(checkpoint);
        res?;
        checkpointed.context("error checkpointing buffer")
    }

    async fn process(&self, mut records: Vec<Record>, draining: bool) -> Result<()> {
        if records.is_empty() && !self.accepts_empty_batch(draining) {
            return Ok(());
        }
        let read = records.len();
        for processor in self.processors.iter() {
            records = processor.execute(records).await?;
        }
        if read > 0 {
            metrics::counter!(METRIC_RECORDS_PROCESSED, "pipeline" => self.pipeline.name().to_string()).increment(read as u64);
        }
        if records.is_empty() {
            return Ok(());
        }

        let handles = self.pipeline.publish_to_sinks(records)?;
        let mut first_err = None;
        for handle in handles {
            let res = handle.await.context("error joining sink task").and_then(|res| res);
            if let Err(err) = res {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Check if the processor lane should run even though no records were read.
    fn accepts_empty_batch(&self, draining: bool) -> bool {
        (draining && !self.is_ready_for_shutdown()) || self.processors.iter().any(|processor| processor.process_empty_batches())
    }

    fn is_ready_for_shutdown(&self) -> bool {
        self.processors.iter().all(|processor| processor.is_ready_for_shutdown())
    }

    fn shutdown_error(&self, source: anyhow::Error) -> ShutdownError {
        ShutdownError {
            pipeline: self.pipeline.name().to_string(),
            source,
        }
    }
}
