//! Runtime configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// The default path on which peers receive forwarded events.
pub const DEFAULT_PEER_FORWARDER_PATH: &str = "/event/forward";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,
    /// The port on which the Prometheus metrics endpoint is served.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,
    /// The time each of a pipeline's task pools is given to terminate gracefully.
    #[serde(default = "Config::default_pipeline_shutdown_timeout_ms")]
    pub pipeline_shutdown_timeout_ms: u64,

    /// Enable forwarding of events between peers for processors which require it.
    #[serde(default)]
    pub peer_forwarder_enabled: bool,
    /// The port on which this node receives events forwarded from its peers.
    #[serde(default = "Config::default_peer_forwarder_port")]
    pub peer_forwarder_port: u16,
    /// The HTTP path on which this node receives events forwarded from its peers.
    #[serde(default = "Config::default_peer_forwarder_path")]
    pub peer_forwarder_path: String,
    /// The address under which this node appears in the peer list.
    ///
    /// Keys owned by this address are processed locally instead of being forwarded.
    #[serde(default = "Config::default_peer_forwarder_local_address")]
    pub peer_forwarder_local_address: String,
    /// The static list of peer addresses making up the fleet, this node included.
    #[serde(default)]
    pub peer_forwarder_static_endpoints: Vec<String>,
    /// The number of virtual nodes placed on the hash ring for each peer.
    #[serde(default = "Config::default_peer_forwarder_virtual_nodes")]
    pub peer_forwarder_virtual_nodes: u32,
    /// The timeout applied to each forwarding request.
    #[serde(default = "Config::default_peer_forwarder_request_timeout_ms")]
    pub peer_forwarder_request_timeout_ms: u64,
    /// The capacity of each receive buffer.
    #[serde(default = "Config::default_peer_forwarder_buffer_size")]
    pub peer_forwarder_buffer_size: usize,
    /// The max number of records drained from a receive buffer in a single read.
    #[serde(default = "Config::default_peer_forwarder_batch_size")]
    pub peer_forwarder_batch_size: usize,
    /// The max number of events sent to a peer in a single request.
    #[serde(default = "Config::default_peer_forwarder_forwarding_batch_size")]
    pub peer_forwarder_forwarding_batch_size: usize,
    /// The interval at which the peer list is polled for changes.
    #[serde(default = "Config::default_peer_forwarder_discovery_refresh_secs")]
    pub peer_forwarder_discovery_refresh_secs: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this just parses the runtime environment and builds the application config from
    /// that. Pipeline definitions are not part of this config, they are supplied programmatically.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants which serde can not express.
    pub fn validate(&self) -> Result<()> {
        if self.peer_forwarder_batch_size == 0 || self.peer_forwarder_buffer_size == 0 {
            bail!("PEER_FORWARDER_BUFFER_SIZE and PEER_FORWARDER_BATCH_SIZE must be greater than 0");
        }
        if self.peer_forwarder_batch_size > self.peer_forwarder_buffer_size {
            bail!(
                "PEER_FORWARDER_BATCH_SIZE ({}) must not exceed PEER_FORWARDER_BUFFER_SIZE ({})",
                self.peer_forwarder_batch_size,
                self.peer_forwarder_buffer_size
            );
        }
        if self.peer_forwarder_forwarding_batch_size == 0 {
            bail!("PEER_FORWARDER_FORWARDING_BATCH_SIZE must be greater than 0");
        }
        if self.peer_forwarder_forwarding_batch_size > self.peer_forwarder_buffer_size {
            bail!(
                "PEER_FORWARDER_FORWARDING_BATCH_SIZE ({}) must not exceed PEER_FORWARDER_BUFFER_SIZE ({}), as peers reject larger requests",
                self.peer_forwarder_forwarding_batch_size,
                self.peer_forwarder_buffer_size
            );
        }
        if !self.peer_forwarder_path.starts_with('/') {
            bail!("PEER_FORWARDER_PATH must begin with `/`, got `{}`", self.peer_forwarder_path);
        }
        if self.peer_forwarder_enabled && self.peer_forwarder_static_endpoints.is_empty() {
            bail!("PEER_FORWARDER_STATIC_ENDPOINTS must not be empty when peer forwarding is enabled");
        }
        Ok(())
    }

    /// The time each of a pipeline's task pools is given to terminate gracefully.
    pub fn pipeline_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_shutdown_timeout_ms)
    }

    /// The timeout applied to each forwarding request.
    pub fn peer_forwarder_request_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_forwarder_request_timeout_ms)
    }

    /// The timeout used for receive buffer writes.
    ///
    /// This is 80% of the request timeout, so that overflow is detected and reported before the
    /// sending peer gives up on the request.
    pub fn peer_forwarder_receive_write_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_forwarder_request_timeout_ms.saturating_mul(8) / 10)
    }

    /// The interval at which the peer list is polled for changes.
    pub fn peer_forwarder_discovery_refresh(&self) -> Duration {
        Duration::from_secs(self.peer_forwarder_discovery_refresh_secs)
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_metrics_port() -> u16 {
        9090
    }

    fn default_pipeline_shutdown_timeout_ms() -> u64 {
        10_000
    }

    fn default_peer_forwarder_port() -> u16 {
        4994
    }

    fn default_peer_forwarder_path() -> String {
        DEFAULT_PEER_FORWARDER_PATH.into()
    }

    fn default_peer_forwarder_local_address() -> String {
        "127.0.0.1".into()
    }

    fn default_peer_forwarder_virtual_nodes() -> u32 {
        128
    }

    fn default_peer_forwarder_request_timeout_ms() -> u64 {
        10_000
    }

    fn default_peer_forwarder_buffer_size() -> usize {
        512
    }

    fn default_peer_forwarder_batch_size() -> usize {
        48
    }

    fn default_peer_forwarder_forwarding_batch_size() -> usize {
        500
    }

    fn default_peer_forwarder_discovery_refresh_secs() -> u64 {
        30
    }
}

#[cfg(test)]
impl Config {
    /// Create a config instance for use in tests, with peer forwarding disabled.
    pub fn new_test() -> Result<std::sync::Arc<Self>> {
        let config: Config = envy::from_iter(vec![("RUST_LOG".to_string(), "debug".to_string())]).context("error building test config")?;
        config.validate()?;
        Ok(std::sync::Arc::new(config))
    }
}
