//! Hadron Flow, a telemetry pipeline engine.
//!
//! Records flow from a source, through a bounded buffer and ordered processor stages, to one or
//! more routed sinks. Keyed, stateful processors may be sharded across a fleet of nodes through
//! peer forwarding.
//!
//! The crate ships no binary: an embedding process registers its plugins, builds its pipelines
//! and hands them to an [`App`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hadron_flow::{App, Config, Engine, PipelineBuilder, PluginRegistry, PluginSetting};
//!
//! async fn run(registry: &PluginRegistry) -> anyhow::Result<()> {
//!     let config = Arc::new(Config::new()?);
//!     hadron_flow::observability::init_tracing(&config)?;
//!     let pipeline = PipelineBuilder::new("logs", registry)
//!         .source(PluginSetting::new("http"))
//!         .sink(PluginSetting::new("stdout"), Vec::<String>::new())
//!         .build()?;
//!     let engine = Engine::new(vec![pipeline])?;
//!     App::new(config, engine, None).await?.spawn().await??;
//!     Ok(())
//! }
//! ```

mod app;
#[cfg(test)]
mod app_test;
pub mod buffer;
pub mod config;
#[cfg(test)]
mod config_test;
mod engine;
pub mod error;
pub mod model;
pub mod observability;
pub mod peer_forwarder;
pub mod pipeline;
pub mod router;
mod server;
pub mod state;

pub use crate::app::App;
pub use crate::config::Config;
pub use crate::engine::Engine;
pub use crate::error::AppError;
pub use crate::pipeline::{
    Pipeline, PipelineBuilder, PipelineConnector, PipelineOptions, PipelineState, PluginRegistry, PluginSetting, Processor, Sink, Source,
};
pub use crate::state::KeyedState;
pub use async_trait::async_trait;
