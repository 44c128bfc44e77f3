use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::pipeline::{Processor, Sink, Source, StageGroup};

/// The settings of a single plugin instance.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PluginSetting {
    /// The name under which the plugin is registered.
    pub name: String,
    /// An ID unique within the pipeline, defaulting to the plugin's name.
    #[serde(default)]
    pub id: Option<String>,
    /// Plugin specific settings.
    #[serde(default)]
    pub settings: Value,
}

impl PluginSetting {
    /// Create a new instance for the given plugin, without settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            settings: Value::Null,
        }
    }

    /// Set this plugin's ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set this plugin's settings.
    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    /// The ID of this plugin instance.
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    /// Deserialize this plugin's settings into a typed config.
    pub fn parse_settings<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        let settings = if self.settings.is_null() { Value::Object(Default::default()) } else { self.settings.clone() };
        serde_json::from_value(settings).with_context(|| format!("invalid settings for plugin `{}`", self.id()))
    }
}

type SourceFactory = Arc<dyn Fn(&PluginSetting) -> Result<Arc<dyn Source>> + Send + Sync>;
type ProcessorFactory = Arc<dyn Fn(&PluginSetting) -> Result<Arc<dyn Processor>> + Send + Sync>;
type SinkFactory = Arc<dyn Fn(&PluginSetting) -> Result<Arc<dyn Sink>> + Send + Sync>;

/// A registered processor factory.
#[derive(Clone)]
struct ProcessorRegistration {
    factory: ProcessorFactory,
    /// Instances of this processor must never be shared between workers.
    single_thread: bool,
}

/// A runtime mapping of plugin names to the factories creating them.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    sources: HashMap<String, SourceFactory>,
    processors: HashMap<String, ProcessorRegistration>,
    sinks: HashMap<String, SinkFactory>,
}

impl PluginRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source factory.
    pub fn register_source<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&PluginSetting) -> Result<Arc<dyn Source>> + Send + Sync + 'static,
    {
        self.sources.insert(name.into(), Arc::new(factory));
        self
    }

    /// Register a processor factory whose instances may be shared by all workers.
    pub fn register_processor<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&PluginSetting) -> Result<Arc<dyn Processor>> + Send + Sync + 'static,
    {
        self.processors.insert(name.into(), ProcessorRegistration { factory: Arc::new(factory), single_thread: false });
        self
    }

    /// Register a processor factory whose instances must each be used by a single worker only.
    pub fn register_single_thread_processor<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&PluginSetting) -> Result<Arc<dyn Processor>> + Send + Sync + 'static,
    {
        self.processors.insert(name.into(), ProcessorRegistration { factory: Arc::new(factory), single_thread: true });
        self
    }

    /// Register a sink factory.
    pub fn register_sink<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&PluginSetting) -> Result<Arc<dyn Sink>> + Send + Sync + 'static,
    {
        self.sinks.insert(name.into(), Arc::new(factory));
        self
    }

    /// Create the source described by the given settings.
    pub fn build_source(&self, setting: &PluginSetting) -> Result<Arc<dyn Source>> {
        let factory = self.sources.get(&setting.name).ok_or_else(|| AppError::UnknownPlugin(setting.name.clone()))?;
        factory(setting).with_context(|| format!("error creating source `{}`", setting.id()))
    }

    /// Create the stage group described by the given settings, for a pipeline of `workers` workers.
    ///
    /// Single-threaded processors get one instance per worker, all others a single shared one.
    pub fn build_stage(&self, setting: &PluginSetting, workers: usize) -> Result<StageGroup> {
        let registration = self.processors.get(&setting.name).ok_or_else(|| AppError::UnknownPlugin(setting.name.clone()))?;
        let build = || (registration.factory)(setting).with_context(|| format!("error creating processor `{}`", setting.id()));
        if !registration.single_thread {
            return Ok(StageGroup::Shared(build()?));
        }
        let processors = (0..workers).map(|_| build()).collect::<Result<Vec<_>>>()?;
        Ok(StageGroup::PerWorker(processors))
    }

    /// Create the sink described by the given settings.
    pub fn build_sink(&self, setting: &PluginSetting) -> Result<Arc<dyn Sink>> {
        let factory = self.sinks.get(&setting.name).ok_or_else(|| AppError::UnknownPlugin(setting.name.clone()))?;
        factory(setting).with_context(|| format!("error creating sink `{}`", setting.id()))
    }
}
