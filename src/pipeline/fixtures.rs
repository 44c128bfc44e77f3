use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::prelude::*;

use crate::buffer::{BoundedBuffer, Buffer, WriteOutcome};
use crate::model::{Event, Record};
use crate::pipeline::{PipelineOptions, PipelineParts, Processor, Sink, Source, StageGroup};
use crate::router::{ConditionalRoutes, DataFlowComponent, Router};

/// A shared, ordered log of lifecycle calls made on test plugins.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// The position of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|val| val == entry)
    }
}

/// Build `count` records, each with a sequential `seq` attribute.
pub fn records(count: usize) -> Vec<Record> {
    (0..count).map(|seq| Record::new(Event::new("test").with("seq", seq as u64))).collect()
}

/// Build a random number of records between 50 and 100.
pub fn random_records() -> Vec<Record> {
    records(rand::thread_rng().gen_range(50..100))
}

/// Fast pipeline options for tests.
pub fn test_options(workers: usize) -> PipelineOptions {
    PipelineOptions {
        workers,
        read_timeout: Duration::from_millis(20),
        sink_ready_timeout: Duration::from_millis(500),
        shutdown_timeout: Duration::from_secs(5),
    }
}

/// Assemble pipeline parts from a source, stages and sinks, with a fresh buffer and no routes.
pub fn parts(name: &str, source: Arc<dyn Source>, stages: Vec<StageGroup>, sinks: Vec<Arc<dyn Sink>>, workers: usize) -> Result<PipelineParts> {
    Ok(PipelineParts {
        name: name.into(),
        source,
        buffer: Arc::new(BoundedBuffer::new(name, 256, 16)?),
        stages,
        sinks: sinks
            .into_iter()
            .enumerate()
            .map(|(idx, sink)| DataFlowComponent::new(format!("sink-{}", idx), sink, Vec::<String>::new()))
            .collect(),
        router: Router::new(Arc::new(ConditionalRoutes::new())),
        options: test_options(workers),
        upstream: vec![],
        downstream: vec![],
    })
}

/// A source which writes a fixed set of records into its buffer once started.
pub struct TestSource {
    records: Mutex<Vec<Record>>,
    stopped: Arc<AtomicBool>,
    log: CallLog,
}

impl TestSource {
    pub fn new(records: Vec<Record>, log: CallLog) -> Self {
        Self {
            records: Mutex::new(records),
            stopped: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for TestSource {
    async fn start(&self, buffer: Arc<dyn Buffer>) -> Result<()> {
        self.log.push("source.start");
        let records = std::mem::take(&mut *self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            for record in records {
                let mut pending = record;
                while !stopped.load(Ordering::SeqCst) {
                    match buffer.write(pending, Duration::from_millis(50)).await {
                        WriteOutcome::Admitted => break,
                        WriteOutcome::TimedOut(mut recs) | WriteOutcome::TooLarge(mut recs) => match recs.pop() {
                            Some(rec) => pending = rec,
                            None => break,
                        },
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        self.log.push("source.stop");
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// A source which takes a while to start, and admits records until stopped.
pub struct SlowSource {
    delay: Duration,
    running: AtomicBool,
}

impl SlowSource {
    pub fn new(delay: Duration) -> Self {
        Self { delay, running: AtomicBool::new(false) }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for SlowSource {
    async fn start(&self, _buffer: Arc<dyn Buffer>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// A processor which tags every event and records its lifecycle calls.
pub struct TaggingProcessor {
    name: String,
    log: CallLog,
    pub calls: AtomicUsize,
    pub empty_calls: AtomicUsize,
}

impl TaggingProcessor {
    pub fn new(name: &str, log: CallLog) -> Self {
        Self {
            name: name.into(),
            log,
            calls: AtomicUsize::new(0),
            empty_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Processor for TaggingProcessor {
    async fn execute(&self, mut records: Vec<Record>) -> Result<Vec<Record>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if records.is_empty() {
            self.empty_calls.fetch_add(1, Ordering::SeqCst);
        }
        for record in records.iter_mut() {
            record.event_mut().tag(self.name.clone());
        }
        Ok(records)
    }

    fn prepare_for_shutdown(&self) {
        self.log.push(format!("{}.prepare_for_shutdown", self.name));
    }

    async fn shutdown(&self) {
        self.log.push(format!("{}.shutdown", self.name));
    }
}

/// A processor which holds back every record until shutdown is prepared, then flushes them.
#[derive(Default)]
pub struct HoldingProcessor {
    held: Mutex<Vec<Record>>,
    preparing: AtomicBool,
}

impl HoldingProcessor {
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

#[async_trait]
impl Processor for HoldingProcessor {
    async fn execute(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.extend(records);
        if self.preparing.load(Ordering::SeqCst) {
            return Ok(std::mem::take(&mut *held));
        }
        Ok(vec![])
    }

    fn prepare_for_shutdown(&self) {
        self.preparing.store(true, Ordering::SeqCst);
    }

    fn is_ready_for_shutdown(&self) -> bool {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).is_empty()
    }
}

/// A processor which fails on every non-empty batch.
pub struct FailingProcessor;

#[async_trait]
impl Processor for FailingProcessor {
    async fn execute(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        if records.is_empty() {
            return Ok(records);
        }
        bail!("processor failure")
    }
}

/// A sink collecting everything it receives.
pub struct CollectingSink {
    name: String,
    log: CallLog,
    received: Mutex<Vec<Record>>,
    pub ready: AtomicBool,
    pub fail: AtomicBool,
}

impl CollectingSink {
    pub fn new(name: &str, log: CallLog) -> Self {
        Self {
            name: name.into(),
            log,
            received: Mutex::new(vec![]),
            ready: AtomicBool::new(true),
            fail: AtomicBool::new(false),
        }
    }

    pub fn received(&self) -> Vec<Record> {
        self.received.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    /// Wait up to `timeout` for at least `count` records to arrive.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.received_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.received_count() >= count
    }
}

#[async_trait]
impl Sink for CollectingSink {
    async fn output(&self, records: Vec<Record>) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("sink {} failure", self.name);
        }
        self.received.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).extend(records);
        Ok(())
    }

    async fn shutdown(&self) {
        self.log.push(format!("{}.shutdown", self.name));
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
