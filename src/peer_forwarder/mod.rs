//! Peer forwarding.
//!
//! Lets a keyed, stateful processor scale across a fleet of nodes. Every node builds the same
//! consistent hash ring over the fleet's endpoints, so all events sharing identification values
//! are processed on the one node owning their hash. Forwarding is best-effort: whatever can not be
//! forwarded is processed locally.

mod client;
mod decorator;
mod discovery;
#[cfg(test)]
mod fixtures;
mod hash_ring;
mod receive;
mod remote;
#[cfg(test)]
mod remote_test;
mod service;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::model::IdentificationKeys;
use crate::server;

pub use client::{ClientPool, ForwardResponse, ForwardingRequest, PeerForwarderClient};
pub use decorator::PeerForwardingProcessor;
pub use discovery::{DiscoveryTask, PeerListProvider, StaticPeerListProvider};
pub use hash_ring::{HashRing, PeerRing};
pub use receive::{ReceiveBufferMap, ReceiveBuffers};
pub use remote::RemotePeerForwarder;
pub use service::{ReceiveError, ReceiveService};

pub(crate) const METRIC_RECORDS_FORWARDED: &str = "hadron_flow_peer_forwarder_records_forwarded";
pub(crate) const METRIC_FORWARDING_FAILURES: &str = "hadron_flow_peer_forwarder_forwarding_failures";
pub(crate) const METRIC_RECORDS_PROCESSED_LOCALLY: &str = "hadron_flow_peer_forwarder_records_processed_locally";
pub(crate) const METRIC_RECORDS_RECEIVED: &str = "hadron_flow_peer_forwarder_records_received";

/// Everything the peer forwarding subsystem of a node shares: the hash ring, the client pool and
/// the receive buffers.
pub struct PeerForwarderContext {
    config: Arc<Config>,
    ring: Arc<PeerRing>,
    client: Arc<PeerForwarderClient>,
    receive_buffers: ReceiveBuffers,
    provider: Arc<dyn PeerListProvider>,
}

impl PeerForwarderContext {
    /// Create a new instance, building the initial hash ring from the given provider.
    pub async fn new(config: Arc<Config>, provider: Arc<dyn PeerListProvider>) -> Result<Arc<Self>> {
        let peers = provider.peers().await.context("error fetching initial peer list")?;
        let ring = Arc::new(PeerRing::new(peers, config.peer_forwarder_virtual_nodes).context("error building peer hash ring")?);
        let pool = Arc::new(ClientPool::new(config.peer_forwarder_request_timeout()));
        let client = Arc::new(PeerForwarderClient::new(pool, config.peer_forwarder_port, config.peer_forwarder_path.clone()));
        let receive_buffers = ReceiveBuffers::new(config.peer_forwarder_buffer_size, config.peer_forwarder_batch_size);
        Ok(Arc::new(Self {
            config,
            ring,
            client,
            receive_buffers,
            provider,
        }))
    }

    /// Create a new instance over the static endpoints of the given config.
    pub async fn from_config(config: Arc<Config>) -> Result<Arc<Self>> {
        let provider = Arc::new(StaticPeerListProvider::new(config.peer_forwarder_static_endpoints.clone()));
        Self::new(config, provider).await
    }

    /// The hash ring of the fleet.
    pub fn ring(&self) -> &Arc<PeerRing> {
        &self.ring
    }

    /// Create the forwarder of a keyed processor, registering its receive buffer.
    pub fn create_forwarder(&self, pipeline: &str, plugin_id: &str, keys: Vec<String>) -> Result<Arc<RemotePeerForwarder>> {
        let keys = IdentificationKeys::new(keys).with_context(|| format!("invalid identification keys for {}/{}", pipeline, plugin_id))?;
        let receive_buffer = self.receive_buffers.register(pipeline, plugin_id)?;
        Ok(Arc::new(RemotePeerForwarder::new(
            pipeline,
            plugin_id,
            keys,
            self.ring.clone(),
            self.client.clone(),
            self.config.peer_forwarder_local_address.clone(),
            receive_buffer,
            self.config.peer_forwarder_forwarding_batch_size,
        )))
    }

    /// Create the receiving service, freezing the set of receive buffers.
    pub fn receive_service(&self) -> Result<Arc<ReceiveService>> {
        let buffers = self.receive_buffers.freeze()?;
        Ok(ReceiveService::new(buffers, self.config.peer_forwarder_receive_write_timeout()))
    }

    /// Spawn the receiving server on the given listener, freezing the set of receive buffers.
    pub fn spawn_server(&self, listener: TcpListener, shutdown: broadcast::Receiver<()>) -> Result<(Arc<ReceiveService>, JoinHandle<Result<()>>)> {
        let service = self.receive_service()?;
        let app = service.router(&self.config.peer_forwarder_path);
        Ok((service, server::spawn_server("peer forwarder", listener, app, shutdown)))
    }

    /// Spawn the task keeping the hash ring in sync with the peer list.
    pub fn spawn_discovery(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        DiscoveryTask::new(self.provider.clone(), self.ring.clone(), self.config.peer_forwarder_discovery_refresh(), shutdown).spawn()
    }
}
