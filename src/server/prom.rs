use anyhow::Result;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Spawns a prometheus server which renders the metrics of the given recorder handle.
pub fn spawn_prom_server(listener: TcpListener, handle: PrometheusHandle, shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let app = Router::new().route("/metrics", get(prometheus_scrape)).with_state(handle);
    super::spawn_server("metrics", listener, app, shutdown)
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(State(handle): State<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, handle.render())
}
