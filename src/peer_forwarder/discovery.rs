use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::prelude::*;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::peer_forwarder::PeerRing;

/// A supplier of the current peer endpoint list.
#[async_trait]
pub trait PeerListProvider: Send + Sync {
    /// The endpoints of every peer of the fleet, this node included.
    async fn peers(&self) -> Result<Vec<String>>;
}

/// A peer list provider backed by a fixed list of endpoints.
#[derive(Clone, Debug)]
pub struct StaticPeerListProvider {
    endpoints: Vec<String>,
}

impl StaticPeerListProvider {
    /// Create a new instance.
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl PeerListProvider for StaticPeerListProvider {
    async fn peers(&self) -> Result<Vec<String>> {
        Ok(self.endpoints.clone())
    }
}

/// A task which periodically polls a peer list provider and rebuilds the hash ring on change.
pub struct DiscoveryTask {
    provider: Arc<dyn PeerListProvider>,
    ring: Arc<PeerRing>,
    interval: Duration,
    shutdown: BroadcastStream<()>,
}

impl DiscoveryTask {
    /// Create a new instance.
    pub fn new(provider: Arc<dyn PeerListProvider>, ring: Arc<PeerRing>, interval: Duration, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            provider,
            ring,
            interval,
            shutdown: BroadcastStream::new(shutdown),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!(interval = ?self.interval, "peer discovery task has started");
        let mut ticks = tokio::time::interval(self.interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticks.tick() => self.refresh().await,
                _ = self.shutdown.next() => break,
            }
        }
        tracing::debug!("peer discovery task has shutdown");
    }

    /// Poll the provider once, keeping the current ring on any failure.
    async fn refresh(&self) {
        let peers = match self.provider.peers().await {
            Ok(peers) => peers,
            Err(err) => {
                tracing::error!(error = ?err, "error fetching peer list, keeping current hash ring");
                return;
            }
        };
        if let Err(err) = self.ring.rebuild(peers) {
            tracing::error!(error = ?err, "error rebuilding hash ring, keeping current hash ring");
        }
    }
}
