use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::buffer::{BoundedBuffer, Buffer};
use crate::error::AppError;
use crate::peer_forwarder::{PeerForwarderContext, PeerForwardingProcessor};
use crate::pipeline::{
    Pipeline, PipelineConnector, PipelineOptions, PipelineParts, PluginRegistry, PluginSetting, Processor, Sink, Source, StageGroup,
};
use crate::router::{ConditionalRoutes, DataFlowComponent, Router};

/// The default capacity of a pipeline's buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 12_800;
/// The default max number of records a worker reads in one batch.
pub const DEFAULT_BUFFER_BATCH_SIZE: usize = 200;

enum SourceKind {
    Plugin(PluginSetting),
    Connector(Arc<PipelineConnector>),
}

enum SinkKind {
    Plugin(PluginSetting, Vec<String>),
    Connector(Arc<PipelineConnector>, Vec<String>),
}

/// A builder assembling a pipeline from plugin settings.
pub struct PipelineBuilder<'a> {
    name: String,
    registry: &'a PluginRegistry,
    source: Option<SourceKind>,
    buffer: (usize, usize),
    processors: Vec<PluginSetting>,
    sinks: Vec<SinkKind>,
    routes: ConditionalRoutes,
    options: PipelineOptions,
    peer_forwarder: Option<Arc<PeerForwarderContext>>,
}

impl<'a> PipelineBuilder<'a> {
    /// Create a new builder for the named pipeline, creating plugins through the given registry.
    pub fn new(name: impl Into<String>, registry: &'a PluginRegistry) -> Self {
        Self {
            name: name.into(),
            registry,
            source: None,
            buffer: (DEFAULT_BUFFER_CAPACITY, DEFAULT_BUFFER_BATCH_SIZE),
            processors: vec![],
            sinks: vec![],
            routes: ConditionalRoutes::new(),
            options: PipelineOptions::default(),
            peer_forwarder: None,
        }
    }

    /// Use the registered source described by the given settings.
    pub fn source(mut self, setting: PluginSetting) -> Self {
        self.source = Some(SourceKind::Plugin(setting));
        self
    }

    /// Read from another pipeline through the given connector.
    pub fn source_from(mut self, connector: Arc<PipelineConnector>) -> Self {
        self.source = Some(SourceKind::Connector(connector));
        self
    }

    /// Set the capacity and read batch size of the pipeline's buffer.
    pub fn buffer(mut self, capacity: usize, batch_size: usize) -> Self {
        self.buffer = (capacity, batch_size);
        self
    }

    /// Append a processor stage.
    pub fn processor(mut self, setting: PluginSetting) -> Self {
        self.processors.push(setting);
        self
    }

    /// Add a sink receiving the records matching any of the given routes, or all records if none
    /// are given.
    pub fn sink<R: Into<String>>(mut self, setting: PluginSetting, routes: impl IntoIterator<Item = R>) -> Self {
        self.sinks.push(SinkKind::Plugin(setting, routes.into_iter().map(Into::into).collect()));
        self
    }

    /// Feed another pipeline through the given connector.
    pub fn sink_to<R: Into<String>>(mut self, connector: Arc<PipelineConnector>, routes: impl IntoIterator<Item = R>) -> Self {
        self.sinks.push(SinkKind::Connector(connector, routes.into_iter().map(Into::into).collect()));
        self
    }

    /// Set the routes sinks may be restricted to.
    pub fn routes(mut self, routes: ConditionalRoutes) -> Self {
        self.routes = routes;
        self
    }

    pub fn options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Enable peer forwarding for processors declaring identification keys.
    pub fn peer_forwarder(mut self, context: Arc<PeerForwarderContext>) -> Self {
        self.peer_forwarder = Some(context);
        self
    }

    /// Build the pipeline.
    pub fn build(self) -> Result<Arc<Pipeline>> {
        let mut upstream = vec![];
        let source: Arc<dyn Source> = match self.source {
            Some(SourceKind::Plugin(ref setting)) => self.registry.build_source(setting)?,
            Some(SourceKind::Connector(ref connector)) => {
                if connector.downstream() != self.name {
                    return Err(self.invalid(format!("connector to `{}` can not be its source", connector.downstream())));
                }
                upstream.push(connector.upstream().to_string());
                let source: Arc<dyn Source> = connector.clone();
                source
            }
            None => return Err(self.invalid("no source configured".into())),
        };

        let (capacity, batch_size) = self.buffer;
        let buffer = BoundedBuffer::new(self.name.clone(), capacity, batch_size)
            .with_context(|| format!("invalid buffer of pipeline `{}`", self.name))?;
        let buffer: Arc<dyn Buffer> = Arc::new(buffer);

        let mut stages = Vec::with_capacity(self.processors.len());
        for setting in self.processors.iter() {
            let stage = self.registry.build_stage(setting, self.options.workers)?;
            stages.push(self.with_peer_forwarding(setting, stage)?);
        }

        let route_names: HashSet<&str> = self.routes.names().collect();
        let mut downstream = vec![];
        let mut sinks = Vec::with_capacity(self.sinks.len());
        for kind in self.sinks.iter() {
            let (name, sink, routes): (String, Arc<dyn Sink>, &Vec<String>) = match kind {
                SinkKind::Plugin(setting, routes) => (setting.id().to_string(), self.registry.build_sink(setting)?, routes),
                SinkKind::Connector(connector, routes) => {
                    if connector.upstream() != self.name {
                        return Err(self.invalid(format!("connector from `{}` can not be its sink", connector.upstream())));
                    }
                    downstream.push(connector.downstream().to_string());
                    let sink: Arc<dyn Sink> = connector.clone();
                    (connector.downstream().to_string(), sink, routes)
                }
            };
            if let Some(route) = routes.iter().find(|route| !route_names.contains(route.as_str())) {
                return Err(self.invalid(format!("sink `{}` uses undefined route `{}`", name, route)));
            }
            sinks.push(DataFlowComponent::new(name, sink, routes.iter().cloned()));
        }

        let router = Router::new(Arc::new(self.routes));
        Pipeline::new(PipelineParts {
            name: self.name,
            source,
            buffer,
            stages,
            sinks,
            router,
            options: self.options,
            upstream,
            downstream,
        })
    }

    /// Wrap every processor of the stage for peer forwarding if it declares identification keys.
    ///
    /// All instances of a stage share one forwarder, and so one receive buffer.
    fn with_peer_forwarding(&self, setting: &PluginSetting, stage: StageGroup) -> Result<StageGroup> {
        let context = match self.peer_forwarder.as_ref() {
            Some(context) => context,
            None => return Ok(stage),
        };
        let keys = match stage.processors().first().and_then(|processor| processor.identification_keys()) {
            Some(keys) => keys,
            None => return Ok(stage),
        };
        let forwarder = context.create_forwarder(&self.name, setting.id(), keys)?;
        tracing::debug!(pipeline = %self.name, plugin = setting.id(), "enabling peer forwarding for processor");
        let wrap = |processor: &Arc<dyn Processor>| -> Arc<dyn Processor> {
            Arc::new(PeerForwardingProcessor::new(processor.clone(), forwarder.clone()))
        };
        Ok(match stage {
            StageGroup::Shared(processor) => StageGroup::Shared(wrap(&processor)),
            StageGroup::PerWorker(processors) => StageGroup::PerWorker(processors.iter().map(wrap).collect()),
        })
    }

    fn invalid(&self, msg: String) -> anyhow::Error {
        AppError::InvalidConfig(format!("pipeline `{}`: {}", self.name, msg)).into()
    }
}
