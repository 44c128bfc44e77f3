//! Pipeline orchestration.
//!
//! A pipeline wires one source, one buffer, an ordered list of processor stages and a set of
//! routed sinks into a running flow. Processing runs on a bounded pool of worker tasks, and sink
//! output on a second pool with one slot per sink.

mod builder;
mod connector;
#[cfg(test)]
pub(crate) mod fixtures;
mod plugins;
mod pool;
mod registry;
mod stage;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::buffer::Buffer;
use crate::config::Config;
use crate::error::{AppError, ShutdownError};
use crate::model::Record;
use crate::router::{CopyStrategy, DataFlowComponent, DeepCopyStrategy, Router};
use worker::Worker;

pub use builder::PipelineBuilder;
pub use connector::PipelineConnector;
pub use plugins::{Processor, Sink, Source};
pub use pool::TaskPool;
pub use registry::{PluginRegistry, PluginSetting};
pub use stage::StageGroup;

pub(crate) const METRIC_RECORDS_PROCESSED: &str = "hadron_flow_pipeline_records_processed";
pub(crate) const METRIC_RECORDS_UNROUTED: &str = "hadron_flow_pipeline_records_unrouted";
pub(crate) const METRIC_PIPELINE_FAILURES: &str = "hadron_flow_pipeline_failures";

/// The default time a worker waits for a batch to fill up.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(3000);
/// The default time a starting pipeline waits for its sinks to report ready.
const DEFAULT_SINK_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// The default time each task pool is given to terminate gracefully.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// The interval at which sink readiness is polled during startup.
const SINK_READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The lifecycle state of a pipeline.
///
/// States only ever move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Created,
    Running,
    StopRequested,
    Draining,
    Stopped,
}

/// Tunables of a pipeline.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// The number of worker tasks processing records concurrently.
    pub workers: usize,
    /// The time a worker waits for a batch to fill up.
    pub read_timeout: Duration,
    /// The time a starting pipeline waits for its sinks to report ready.
    pub sink_ready_timeout: Duration,
    /// The time each task pool is given to terminate gracefully during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            read_timeout: DEFAULT_READ_TIMEOUT,
            sink_ready_timeout: DEFAULT_SINK_READY_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl PipelineOptions {
    /// Default options, with the shutdown timeout taken from the runtime config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            shutdown_timeout: config.pipeline_shutdown_timeout(),
            ..Default::default()
        }
    }
}

/// Everything a pipeline is assembled from.
pub struct PipelineParts {
    pub name: String,
    pub source: Arc<dyn Source>,
    pub buffer: Arc<dyn Buffer>,
    pub stages: Vec<StageGroup>,
    pub sinks: Vec<DataFlowComponent<Arc<dyn Sink>>>,
    pub router: Router,
    pub options: PipelineOptions,
    /// The names of the pipelines feeding this one through connectors.
    pub upstream: Vec<String>,
    /// The names of the pipelines this one feeds through connectors.
    pub downstream: Vec<String>,
}

/// A running flow of records from a source, through processors, to sinks.
pub struct Pipeline {
    name: Arc<String>,
    source: Arc<dyn Source>,
    buffer: Arc<dyn Buffer>,
    stages: Vec<StageGroup>,
    sinks: Vec<DataFlowComponent<Arc<dyn Sink>>>,
    router: Router,
    options: PipelineOptions,
    upstream: Vec<String>,
    downstream: Vec<String>,

    /// The pool on which worker tasks run.
    processor_pool: TaskPool,
    /// The pool on which sink output runs.
    sink_pool: TaskPool,

    state: watch::Sender<PipelineState>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    failed: AtomicBool,
}

impl Pipeline {
    /// Create a new instance.
    pub fn new(parts: PipelineParts) -> Result<Arc<Self>> {
        if parts.options.workers == 0 {
            return Err(AppError::InvalidConfig(format!("pipeline `{}` must run at least one worker", parts.name)).into());
        }
        if parts.sinks.is_empty() {
            return Err(AppError::InvalidConfig(format!("pipeline `{}` must have at least one sink", parts.name)).into());
        }
        for (idx, stage) in parts.stages.iter().enumerate() {
            stage.validate(idx, parts.options.workers).with_context(|| format!("invalid stage in pipeline `{}`", parts.name))?;
        }

        let (state, _) = watch::channel(PipelineState::Created);
        Ok(Arc::new(Self {
            processor_pool: TaskPool::new("processor", parts.options.workers),
            sink_pool: TaskPool::new("sink", parts.sinks.len()),
            name: Arc::new(parts.name),
            source: parts.source,
            buffer: parts.buffer,
            stages: parts.stages,
            sinks: parts.sinks,
            router: parts.router,
            options: parts.options,
            upstream: parts.upstream,
            downstream: parts.downstream,
            state,
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }))
    }

    /// The name of this pipeline.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// The current lifecycle state of this pipeline.
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// A receiver of this pipeline's state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Check if shutdown of this pipeline has been requested. Stays true once set.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Check if this pipeline was shut down because of a processor or sink failure.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// The buffer between this pipeline's source and its workers.
    pub fn buffer(&self) -> &Arc<dyn Buffer> {
        &self.buffer
    }

    /// The names of the pipelines feeding this one through connectors.
    pub fn upstream(&self) -> &[String] {
        &self.upstream
    }

    /// The names of the pipelines this one feeds through connectors.
    pub fn downstream(&self) -> &[String] {
        &self.downstream
    }

    /// The number of worker tasks of this pipeline.
    pub fn workers(&self) -> usize {
        self.options.workers
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        self.options.read_timeout
    }

    /// Start this pipeline.
    ///
    /// Starts the source, waits for every sink to be ready, then spawns the worker tasks.
    #[tracing::instrument(level = "debug", skip(self), fields(pipeline = %self.name))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            bail!("pipeline `{}` has already been started", self.name);
        }
        if let Err(err) = self.try_start().await {
            self.shutdown().await;
            return Err(err);
        }
        tracing::info!(pipeline = %self.name, workers = self.options.workers, "pipeline has started");
        Ok(())
    }

    async fn try_start(self: &Arc<Self>) -> Result<()> {
        self.source
            .start(self.buffer.clone())
            .await
            .with_context(|| format!("error starting source of pipeline `{}`", self.name))?;
        self.await_sinks_ready().await?;

        let running = self.state.send_if_modified(|state| {
            if *state != PipelineState::Created {
                return false;
            }
            *state = PipelineState::Running;
            true
        });
        if !running {
            // The shutdown may have stopped the source before it finished starting.
            self.source.stop().await;
            bail!("pipeline `{}` was shut down while starting", self.name);
        }

        for worker_id in 0..self.options.workers {
            let processors = self.stages.iter().map(|stage| stage.processor_for(worker_id)).collect();
            let worker = Worker::new(worker_id, self.clone(), processors);
            let pipeline = self.clone();
            self.processor_pool.spawn(async move {
                if let Err(err) = worker.run().await {
                    pipeline.fail(err);
                }
            })?;
        }
        Ok(())
    }

    async fn await_sinks_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.options.sink_ready_timeout;
        loop {
            let pending: Vec<&str> = self.sinks.iter().filter(|sink| !sink.component().is_ready()).map(|sink| sink.name()).collect();
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("sinks {:?} of pipeline `{}` were not ready within {:?}", pending, self.name, self.options.sink_ready_timeout);
            }
            tokio::time::sleep(SINK_READY_POLL_INTERVAL).await;
        }
    }

    /// Dispatch a final batch to every routed sink concurrently on the sink pool.
    ///
    /// Returns one handle per sink receiving records. A sink's failure fails only its own handle.
    pub fn publish_to_sinks(&self, records: Vec<Record>) -> Result<Vec<JoinHandle<Result<()>>>> {
        let strategy: Option<&dyn CopyStrategy> = if self.sinks.len() > 1 { Some(&DeepCopyStrategy) } else { None };
        let mut handles = Vec::with_capacity(self.sinks.len());
        let mut spawn_err = None;
        let summary = self.router.route(&records, &self.sinks, strategy, |component, subset| {
            let (sink, sink_name) = (component.component().clone(), component.name().to_string());
            let res = self
                .sink_pool
                .spawn(async move { sink.output(subset).await.with_context(|| format!("error from sink `{}`", sink_name)) });
            match res {
                Ok(handle) => handles.push(handle),
                Err(err) => spawn_err = Some(err),
            }
        });
        if let Some(err) = spawn_err {
            return Err(err.into());
        }
        if summary.unrouted > 0 {
            tracing::debug!(pipeline = %self.name, unrouted = summary.unrouted, "records matched no sink route");
            metrics::counter!(METRIC_RECORDS_UNROUTED, "pipeline" => self.name.to_string()).increment(summary.unrouted as u64);
        }
        Ok(handles)
    }

    /// Handle a fatal worker error by shutting down this pipeline, and only this pipeline.
    fn fail(self: &Arc<Self>, err: ShutdownError) {
        tracing::error!(error = ?err, pipeline = %self.name, "pipeline worker failed, shutting down pipeline");
        metrics::counter!(METRIC_PIPELINE_FAILURES, "pipeline" => self.name.to_string()).increment(1);
        self.failed.store(true, Ordering::Release);
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.shutdown().await });
    }

    /// Shut down this pipeline.
    ///
    /// The source is stopped first, then workers drain the buffer and processors, then processors
    /// and sinks are shut down. Calling this again, concurrently or after the fact, only waits
    /// for the first shutdown to complete.
    #[tracing::instrument(level = "debug", skip(self), fields(pipeline = %self.name))]
    pub async fn shutdown(&self) {
        let mut prior = PipelineState::Created;
        let initiated = self.state.send_if_modified(|state| {
            prior = *state;
            match *state {
                PipelineState::Created => *state = PipelineState::Stopped,
                PipelineState::Running => *state = PipelineState::StopRequested,
                _ => return false,
            }
            true
        });
        if !initiated {
            self.wait_stopped().await;
            return;
        }
        if prior == PipelineState::Created {
            self.source.stop().await;
            self.stop_requested.store(true, Ordering::Release);
            self.processor_pool.shutdown();
            self.sink_pool.shutdown();
            tracing::debug!(pipeline = %self.name, "pipeline stopped before it was started");
            return;
        }

        tracing::info!(pipeline = %self.name, "shutting down pipeline");
        self.source.stop().await;
        self.stop_requested.store(true, Ordering::Release);

        self.processors().for_each(|processor| processor.prepare_for_shutdown());
        self.state.send_replace(PipelineState::Draining);

        self.processor_pool.shutdown();
        if !self.processor_pool.await_termination(self.options.shutdown_timeout).await {
            tracing::warn!(pipeline = %self.name, "processor workers were aborted during shutdown");
        }

        for processor in self.processors() {
            processor.shutdown().await;
        }
        for sink in self.sinks.iter() {
            sink.component().shutdown().await;
        }

        self.sink_pool.shutdown();
        if !self.sink_pool.await_termination(self.options.shutdown_timeout).await {
            tracing::warn!(pipeline = %self.name, "sink tasks were aborted during shutdown");
        }

        self.state.send_replace(PipelineState::Stopped);
        tracing::info!(pipeline = %self.name, "pipeline has shut down");
    }

    /// Wait until this pipeline has fully stopped.
    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        let _res = rx.wait_for(|state| *state == PipelineState::Stopped).await;
    }

    /// Every distinct processor instance of this pipeline, in stage order.
    fn processors(&self) -> impl Iterator<Item = &Arc<dyn Processor>> {
        self.stages.iter().flat_map(|stage| stage.processors())
    }
}
