//! Multi-pipeline lifecycle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::error::AppError;
use crate::pipeline::Pipeline;

/// All running pipelines mapped from their name.
pub type PipelinesMap = ArcSwap<HashMap<String, Arc<Pipeline>>>;

/// The owner of every pipeline of a process.
///
/// Pipelines are started downstream first and shut down upstream first, so that records in
/// flight through connectors always have somewhere to go. A pipeline which fails is removed from
/// the engine, along with every pipeline connected to it.
pub struct Engine {
    /// The atomic map of all running pipelines.
    pipelines: PipelinesMap,
    /// Every registered pipeline, running or not.
    registered: HashMap<String, Arc<Pipeline>>,
    /// Pipeline names in upstream-first order.
    order: Vec<String>,
    /// The number of running pipelines.
    running: watch::Sender<usize>,
    executed: AtomicBool,
}

impl Engine {
    /// Create a new instance owning the given pipelines.
    ///
    /// Pipeline names must be unique, and connectors may only link registered pipelines without
    /// forming a cycle.
    pub fn new(pipelines: impl IntoIterator<Item = Arc<Pipeline>>) -> Result<Arc<Self>> {
        let mut registered = HashMap::new();
        for pipeline in pipelines {
            let name = pipeline.name().to_string();
            if registered.insert(name.clone(), pipeline).is_some() {
                return Err(AppError::InvalidConfig(format!("duplicate pipeline name `{}`", name)).into());
            }
        }
        let order = upstream_first(&registered)?;
        let (running, _) = watch::channel(0);
        Ok(Arc::new(Self {
            pipelines: Default::default(),
            registered,
            order,
            running,
            executed: AtomicBool::new(false),
        }))
    }

    /// Start every pipeline.
    ///
    /// A pipeline which fails to start is shut down along with every pipeline connected to it,
    /// the others keep running.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn execute(self: &Arc<Self>) -> Result<()> {
        if self.executed.swap(true, Ordering::AcqRel) {
            bail!("engine has already been executed");
        }
        self.pipelines.store(Arc::new(self.registered.clone()));
        self.publish_running();

        for name in self.order.iter().rev() {
            let pipeline = match self.pipelines.load().get(name) {
                Some(pipeline) => pipeline.clone(),
                // Already removed along with a connected pipeline.
                None => continue,
            };
            self.spawn_watcher(pipeline.clone());
            if let Err(err) = pipeline.start().await {
                tracing::error!(error = ?err, pipeline = %name, "error starting pipeline");
                self.remove(name);
                self.shutdown_connected(name).await;
            }
        }
        tracing::info!(pipelines = ?self.pipeline_names(), "engine has started");
        Ok(())
    }

    /// The names of every running pipeline, sorted.
    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// The running pipeline of the given name.
    pub fn pipeline(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.load().get(name).cloned()
    }

    /// Shut down the named pipeline only.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn shutdown_pipeline(&self, name: &str) -> Result<()> {
        let pipeline = self.remove(name).ok_or_else(|| AppError::UnknownPipeline(name.into()))?;
        pipeline.shutdown().await;
        Ok(())
    }

    /// Shut down every running pipeline, upstream first.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn shutdown(&self) {
        for name in self.order.iter() {
            if let Some(pipeline) = self.remove(name) {
                pipeline.shutdown().await;
            }
        }
        tracing::info!("engine has shut down");
    }

    /// Wait until no pipeline is running anymore.
    pub async fn wait_stopped(&self) {
        let mut rx = self.running.subscribe();
        let _res = rx.wait_for(|running| *running == 0).await;
    }

    /// Watch the given pipeline, removing it from the engine once it stops.
    fn spawn_watcher(self: &Arc<Self>, pipeline: Arc<Pipeline>) {
        let engine = self.clone();
        tokio::spawn(async move {
            pipeline.wait_stopped().await;
            engine.remove(pipeline.name());
            if pipeline.has_failed() {
                tracing::error!(pipeline = %pipeline.name(), "pipeline failed, shutting down connected pipelines");
                engine.shutdown_connected(pipeline.name()).await;
            }
        });
    }

    /// Shut down every running pipeline reachable from the given one through connectors.
    async fn shutdown_connected(&self, name: &str) {
        let mut seen: HashSet<&str> = HashSet::from([name]);
        let mut queue = VecDeque::from([name]);
        while let Some(next) = queue.pop_front() {
            let pipeline = match self.registered.get(next) {
                Some(pipeline) => pipeline,
                None => continue,
            };
            for linked in pipeline.upstream().iter().chain(pipeline.downstream().iter()) {
                if !seen.insert(linked.as_str()) {
                    continue;
                }
                queue.push_back(linked.as_str());
                if let Some(linked) = self.remove(linked) {
                    tracing::warn!(pipeline = %linked.name(), failed = %name, "shutting down pipeline connected to a failed pipeline");
                    linked.shutdown().await;
                }
            }
        }
    }

    /// Remove the named pipeline from the running set.
    fn remove(&self, name: &str) -> Option<Arc<Pipeline>> {
        let mut removed = None;
        self.pipelines.rcu(|pipelines| {
            let mut updated = HashMap::clone(pipelines);
            removed = updated.remove(name);
            updated
        });
        self.publish_running();
        removed
    }

    fn publish_running(&self) {
        self.running.send_replace(self.pipelines.load().len());
    }
}

/// Order the given pipelines so that every pipeline comes before those it feeds.
fn upstream_first(pipelines: &HashMap<String, Arc<Pipeline>>) -> Result<Vec<String>> {
    let mut pending_upstream: HashMap<&str, usize> = HashMap::new();
    for (name, pipeline) in pipelines.iter() {
        for linked in pipeline.upstream().iter().chain(pipeline.downstream().iter()) {
            if !pipelines.contains_key(linked) {
                return Err(AppError::InvalidConfig(format!("pipeline `{}` is connected to unknown pipeline `{}`", name, linked)).into());
            }
        }
        pending_upstream.insert(name.as_str(), pipeline.upstream().len());
    }

    let mut ready: Vec<&str> = pending_upstream.iter().filter(|(_, count)| **count == 0).map(|(name, _)| *name).collect();
    ready.sort_unstable();
    let mut queue = VecDeque::from(ready);
    let mut order = Vec::with_capacity(pipelines.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        let pipeline = match pipelines.get(name) {
            Some(pipeline) => pipeline,
            None => continue,
        };
        for downstream in pipeline.downstream() {
            if let Some(count) = pending_upstream.get_mut(downstream.as_str()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    queue.push_back(downstream.as_str());
                }
            }
        }
    }
    if order.len() != pipelines.len() {
        return Err(AppError::InvalidConfig("pipeline connectors form a cycle".into()).into());
    }
    Ok(order)
}
