use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use thiserror::Error;

use crate::buffer::{Buffer, WriteOutcome};
use crate::model::Record;
use crate::peer_forwarder::{ForwardingRequest, ReceiveBufferMap, METRIC_RECORDS_RECEIVED};

/// Errors returned to a forwarding peer.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The request body is not a valid forwarding request.
    #[error("malformed forwarding request: {0}")]
    Malformed(#[from] serde_json::Error),
    /// No receive buffer is registered for the destination.
    #[error("no receive buffer for {pipeline}/{plugin}")]
    UnknownDestination { pipeline: String, plugin: String },
    /// The batch is larger than the receive buffer can ever hold.
    #[error("batch of {0} events is larger than the receive buffer")]
    TooLarge(usize),
    /// The receive buffer had no room for the batch within the write timeout.
    #[error("no room for a batch of {0} events in the receive buffer")]
    TimedOut(usize),
    /// Any other failure.
    #[error("error receiving forwarded events: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ReceiveError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Malformed(_) | Self::UnknownDestination { .. } => StatusCode::BAD_REQUEST,
            Self::TooLarge(_) | Self::TimedOut(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// The state shared by all requests of the receiving service.
pub struct ReceiveService {
    buffers: Arc<ReceiveBufferMap>,
    write_timeout: Duration,
    received: AtomicU64,
}

impl ReceiveService {
    /// Create a new instance over the given frozen receive buffer map.
    pub fn new(buffers: Arc<ReceiveBufferMap>, write_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            buffers,
            write_timeout,
            received: AtomicU64::new(0),
        })
    }

    /// The total number of events admitted into receive buffers.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// Build the HTTP router serving the given path.
    pub fn router(self: &Arc<Self>, path: &str) -> Router {
        Router::new().route(path, post(receive_events)).with_state(self.clone())
    }

    /// Stage the events of a forwarding request in the destination's receive buffer.
    ///
    /// The buffer write runs on its own task, so that it completes even if the peer disconnects
    /// while the write is waiting for capacity.
    #[tracing::instrument(level = "trace", skip(self, body), fields(size = body.len()))]
    pub async fn receive(self: &Arc<Self>, body: &[u8]) -> Result<usize, ReceiveError> {
        let request: ForwardingRequest = serde_json::from_slice(body)?;
        let buffer = self
            .buffers
            .get(&request.destination_pipeline_name)
            .and_then(|plugins| plugins.get(&request.destination_plugin_id))
            .cloned()
            .ok_or_else(|| ReceiveError::UnknownDestination {
                pipeline: request.destination_pipeline_name.clone(),
                plugin: request.destination_plugin_id.clone(),
            })?;

        let records: Vec<Record> = request.events.into_iter().map(Record::new).collect();
        let count = records.len();
        let (service, pipeline) = (self.clone(), request.destination_pipeline_name);
        let outcome = tokio::spawn(async move {
            let outcome = buffer.write_all(records, service.write_timeout).await;
            if outcome.is_admitted() {
                service.received.fetch_add(count as u64, Ordering::AcqRel);
                metrics::counter!(METRIC_RECORDS_RECEIVED, "pipeline" => pipeline).increment(count as u64);
            }
            outcome
        })
        .await
        .context("error joining receive buffer write")?;

        match outcome {
            WriteOutcome::Admitted => Ok(count),
            WriteOutcome::TooLarge(_) => Err(ReceiveError::TooLarge(count)),
            WriteOutcome::TimedOut(_) => Err(ReceiveError::TimedOut(count)),
        }
    }
}

async fn receive_events(State(service): State<Arc<ReceiveService>>, body: Bytes) -> Response {
    match service.receive(&body).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "rejected forwarded events");
            err.into_response()
        }
    }
}
