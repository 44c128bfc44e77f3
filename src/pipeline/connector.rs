use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rand::Rng;

use crate::buffer::{Buffer, WriteOutcome};
use crate::model::Record;
use crate::pipeline::{Sink, Source};

/// The time a single connector write waits for downstream capacity.
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
/// The upper bound of the random pause between retried writes.
const MAX_RETRY_JITTER_MS: u64 = 50;

/// A link between two pipelines.
///
/// The same connector is a sink of the upstream pipeline and the source of the downstream
/// pipeline. Output of the upstream pipeline is written into the downstream pipeline's buffer,
/// retrying until it is admitted or the connector is stopped.
pub struct PipelineConnector {
    upstream: String,
    downstream: String,
    buffer: ArcSwapOption<Arc<dyn Buffer>>,
    stopped: AtomicBool,
}

impl PipelineConnector {
    /// Create a new instance.
    pub fn new(upstream: impl Into<String>, downstream: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
            buffer: ArcSwapOption::empty(),
            stopped: AtomicBool::new(false),
        })
    }

    /// The name of the pipeline this connector is a sink of.
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// The name of the pipeline this connector is the source of.
    pub fn downstream(&self) -> &str {
        &self.downstream
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Write the given records, retrying until admitted or stopped.
    ///
    /// Returns the number of records which could not be written.
    async fn write_with_retry(&self, buffer: &dyn Buffer, records: Vec<Record>) -> usize {
        let mut batches = vec![records];
        while let Some(mut pending) = batches.pop() {
            loop {
                if self.is_stopped() {
                    return pending.len() + batches.iter().map(Vec::len).sum::<usize>();
                }
                pending = match buffer.write_all(pending, WRITE_TIMEOUT).await {
                    WriteOutcome::Admitted => break,
                    WriteOutcome::TimedOut(records) => records,
                    // The batch can never fit as a whole, so fall back to writing records one by one.
                    WriteOutcome::TooLarge(records) => {
                        batches.extend(records.into_iter().rev().map(|record| vec![record]));
                        break;
                    }
                };
                let jitter = rand::thread_rng().gen_range(0..=MAX_RETRY_JITTER_MS);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
        }
        0
    }
}

#[async_trait]
impl Source for PipelineConnector {
    async fn start(&self, buffer: Arc<dyn Buffer>) -> Result<()> {
        self.buffer.store(Some(Arc::new(buffer)));
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Sink for PipelineConnector {
    async fn output(&self, records: Vec<Record>) -> Result<()> {
        let buffer = match self.buffer.load_full() {
            Some(buffer) => buffer,
            None => anyhow::bail!("pipeline `{}` has not started, can not connect from `{}`", self.downstream, self.upstream),
        };
        let count = records.len();
        let dropped = self.write_with_retry(buffer.as_ref().as_ref(), records).await;
        if dropped > 0 {
            tracing::warn!(upstream = %self.upstream, downstream = %self.downstream, dropped, count, "downstream pipeline stopped, records dropped");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn is_ready(&self) -> bool {
        self.buffer.load().is_some()
    }
}
