//! Logging and metrics setup.

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::prelude::*;

use crate::config::Config;

/// Install the global tracing subscriber, filtered by the given config's `RUST_LOG` directives.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_new(&config.rust_log).with_context(|| format!("invalid RUST_LOG directives `{}`", config.rust_log))?;
    tracing_subscriber::registry()
        .with(filter)
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().compact().with_target(true).with_level(true).with_ansi(true))
        .try_init()
        .context("error initializing logging/tracing system")
}

/// Get a handle to the global Prometheus recorder, installing it on first use.
pub fn install_metrics_recorder(config: &Config) -> Result<PrometheusHandle> {
    static HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
    let mut handle = HANDLE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = handle.as_ref() {
        return Ok(handle.clone());
    }
    let recorder = PrometheusBuilder::new().add_global_label("node", config.peer_forwarder_local_address.clone()).build_recorder();
    let installed = recorder.handle();
    metrics::set_global_recorder(recorder).map_err(|_| anyhow!("a global metrics recorder has already been installed"))?;
    *handle = Some(installed.clone());
    Ok(installed)
}
