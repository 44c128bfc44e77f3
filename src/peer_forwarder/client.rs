use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use http::{header, StatusCode};
use serde::{Deserialize, Serialize};

use crate::model::Event;

/// The body of a forwarding request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForwardingRequest {
    /// The pipeline holding the destination processor.
    pub destination_pipeline_name: String,
    /// The ID of the destination processor.
    pub destination_plugin_id: String,
    /// The forwarded events.
    pub events: Vec<Event>,
}

/// The outcome of a forwarding request.
///
/// Failures which never reached the peer are reported with a synthetic status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForwardResponse {
    status: StatusCode,
}

impl ForwardResponse {
    /// The status of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Check if the peer admitted the forwarded events.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// One HTTP client per peer endpoint, each created on first use.
pub struct ClientPool {
    clients: ArcSwap<HashMap<String, reqwest::Client>>,
    timeout: Duration,
}

impl ClientPool {
    /// Create a new instance whose clients apply the given request timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: Default::default(),
            timeout,
        }
    }

    /// The client for the given endpoint.
    pub fn get(&self, endpoint: &str) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.load().get(endpoint) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .with_context(|| format!("error building HTTP client for peer {}", endpoint))?;
        self.clients.rcu(|clients| {
            let mut clients = HashMap::clone(clients);
            clients.entry(endpoint.to_string()).or_insert_with(|| client.clone());
            clients
        });
        Ok(self.clients.load().get(endpoint).cloned().unwrap_or(client))
    }

    /// The number of clients created so far.
    pub fn len(&self) -> usize {
        self.clients.load().len()
    }

    /// Check if no client has been created yet.
    pub fn is_empty(&self) -> bool {
        self.clients.load().is_empty()
    }
}

/// A client sending batches of events to the peers owning them.
pub struct PeerForwarderClient {
    pool: Arc<ClientPool>,
    port: u16,
    path: String,
}

impl PeerForwarderClient {
    /// Create a new instance.
    ///
    /// Endpoints without a port are contacted on `port`.
    pub fn new(pool: Arc<ClientPool>, port: u16, path: impl Into<String>) -> Self {
        Self { pool, port, path: path.into() }
    }

    /// The URL on which the given peer receives forwarded events.
    pub fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return format!("{}{}", endpoint.trim_end_matches('/'), self.path);
        }
        if endpoint.contains(':') {
            return format!("http://{}{}", endpoint, self.path);
        }
        format!("http://{}:{}{}", endpoint, self.port, self.path)
    }

    /// Forward the given request to a peer.
    ///
    /// Never fails: a request which can not be serialized yields a synthetic 400, one which can
    /// not be delivered a synthetic 503.
    #[tracing::instrument(level = "trace", skip(self, request), fields(events = request.events.len()))]
    pub async fn forward(&self, endpoint: &str, request: &ForwardingRequest) -> ForwardResponse {
        let body = match serde_json::to_vec(request) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = ?err, endpoint, "error serializing forwarding request");
                return ForwardResponse { status: StatusCode::BAD_REQUEST };
            }
        };
        let client = match self.pool.get(endpoint) {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(error = ?err, endpoint, "error getting client for peer");
                return ForwardResponse {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                };
            }
        };
        let res = client
            .post(self.url_for(endpoint))
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;
        match res {
            Ok(res) => ForwardResponse { status: res.status() },
            Err(err) => {
                tracing::warn!(error = ?err, endpoint, "error forwarding events to peer");
                ForwardResponse {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                }
            }
        }
    }
}
