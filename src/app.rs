use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::engine::Engine;
use crate::observability;
use crate::peer_forwarder::PeerForwarderContext;
use crate::server;

/// The application object wiring an engine to the process.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The engine owning every pipeline.
    engine: Arc<Engine>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
    /// The join handle of the peer forwarder server, if peer forwarding is enabled.
    peer_forwarder_server: Option<JoinHandle<Result<()>>>,
    /// The join handle of the peer discovery task, if peer forwarding is enabled.
    discovery: Option<JoinHandle<()>>,
}

impl App {
    /// Create a new instance.
    ///
    /// The peer forwarder context, if any, must already have been used to build every pipeline,
    /// as starting its server freezes the set of receive buffers.
    pub async fn new(config: Arc<Config>, engine: Arc<Engine>, peer_forwarder: Option<Arc<PeerForwarderContext>>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        let handle = observability::install_metrics_recorder(&config)?;
        let listener = server::bind(config.metrics_port).await.context("error binding metrics server")?;
        let metrics_server = server::spawn_prom_server(listener, handle, shutdown_tx.subscribe());

        let (peer_forwarder_server, discovery) = match peer_forwarder {
            Some(context) => {
                let listener = server::bind(config.peer_forwarder_port).await.context("error binding peer forwarder server")?;
                let (_service, server) = context.spawn_server(listener, shutdown_tx.subscribe())?;
                (Some(server), Some(context.spawn_discovery(shutdown_tx.subscribe())))
            }
            None => (None, None),
        };

        Ok(Self {
            _config: config,
            engine,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            metrics_server,
            peer_forwarder_server,
            discovery,
        })
    }

    /// A sender which triggers graceful shutdown of this app.
    pub fn shutdown_tx(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        if let Err(err) = self.engine.execute().await {
            tracing::error!(error = ?err, "error starting pipelines");
            let _ = self.shutdown_tx.send(());
        }
        let engine = self.engine.clone();
        let all_stopped = engine.wait_stopped();
        tokio::pin!(all_stopped);
        tokio::select! {
            Some((_, sig)) = signals.next() => {
                tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
            }
            _ = self.shutdown_rx.next() => (),
            _ = &mut all_stopped => tracing::info!("every pipeline has stopped"),
        }

        // Begin shutdown routine. Pipelines go first, as draining may still forward to peers.
        tracing::debug!("Hadron Flow is shutting down");
        self.engine.shutdown().await;
        let _ = self.shutdown_tx.send(());
        if let Some(server) = self.peer_forwarder_server {
            if let Err(err) = server.await.context("error joining peer forwarder server handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down peer forwarder server");
            }
        }
        if let Some(discovery) = self.discovery {
            if let Err(err) = discovery.await {
                tracing::error!(error = ?err, "error joining peer discovery task");
            }
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("Hadron Flow shutdown complete");
        Ok(())
    }
}
