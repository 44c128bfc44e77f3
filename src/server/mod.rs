//! HTTP servers.

mod prom;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub use prom::spawn_prom_server;

/// Bind a listener on all interfaces at the given port.
pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await.with_context(|| format!("error binding to 0.0.0.0:{}", port))
}

/// Serve the given router on the given listener until a shutdown signal is received.
pub fn spawn_server(name: &'static str, listener: TcpListener, app: Router, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let addr = listener.local_addr().context("error reading listener address")?;
        tracing::info!(%addr, "{} server is listening", name);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _res = shutdown.recv().await;
            })
            .await
            .with_context(|| format!("error from {} server", name))?;
        tracing::debug!("{} server has shutdown", name);
        Ok(())
    })
}
