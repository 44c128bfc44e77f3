use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::model::{Event, Record};
use crate::peer_forwarder::{PeerForwarderContext, ReceiveService, RemotePeerForwarder, StaticPeerListProvider};

pub const PIPELINE: &str = "pipeline";
pub const PLUGIN: &str = "aggregate";

/// A record of the given group, keyed on the `key` attribute.
pub fn keyed_record(key: &str, seq: usize) -> Record {
    Record::new(Event::new("test").with("key", key).with("seq", seq as u64))
}

/// Bind a listener on an ephemeral local port, returning it along with its ring endpoint.
pub async fn listener() -> Result<(TcpListener, String)> {
    let listener = TcpListener::bind("127.0.0.1:0").await.context("error binding test listener")?;
    let addr = listener.local_addr().context("error reading test listener address")?;
    Ok((listener, addr.to_string()))
}

/// A config for a node of a test fleet.
pub fn node_config(local: &str, endpoints: &[String], buffer_size: usize, request_timeout_ms: u64) -> Result<Arc<Config>> {
    let mut config = Config::clone(&*Config::new_test()?);
    config.peer_forwarder_enabled = true;
    config.peer_forwarder_local_address = local.into();
    config.peer_forwarder_static_endpoints = endpoints.to_vec();
    config.peer_forwarder_buffer_size = buffer_size;
    config.peer_forwarder_batch_size = buffer_size;
    config.peer_forwarder_forwarding_batch_size = config.peer_forwarder_forwarding_batch_size.min(buffer_size);
    config.peer_forwarder_request_timeout_ms = request_timeout_ms;
    config.validate()?;
    Ok(Arc::new(config))
}

/// A running peer forwarding node with one registered processor.
pub struct TestNode {
    pub address: String,
    pub forwarder: Arc<RemotePeerForwarder>,
    pub service: Arc<ReceiveService>,
    shutdown: broadcast::Sender<()>,
    server: JoinHandle<Result<()>>,
}

impl TestNode {
    pub async fn start(listener: TcpListener, config: Arc<Config>) -> Result<Self> {
        let provider = Arc::new(StaticPeerListProvider::new(config.peer_forwarder_static_endpoints.clone()));
        let address = config.peer_forwarder_local_address.clone();
        let context = PeerForwarderContext::new(config, provider).await?;
        let forwarder = context.create_forwarder(PIPELINE, PLUGIN, vec!["key".into()])?;
        let (shutdown, _) = broadcast::channel(1);
        let (service, server) = context.spawn_server(listener, shutdown.subscribe())?;
        Ok(Self {
            address,
            forwarder,
            service,
            shutdown,
            server,
        })
    }

    /// The URL on which this node receives forwarded events.
    pub fn url(&self) -> String {
        format!("http://{}{}", self.address, crate::config::DEFAULT_PEER_FORWARDER_PATH)
    }

    pub async fn stop(self) -> Result<()> {
        let _res = self.shutdown.send(());
        self.server.await.context("error joining test server")?
    }
}
