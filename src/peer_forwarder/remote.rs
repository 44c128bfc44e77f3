use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::buffer::{BoundedBuffer, Buffer};
use crate::model::{IdentificationKeys, Record};
use crate::peer_forwarder::{
    ForwardingRequest, PeerForwarderClient, PeerRing, METRIC_FORWARDING_FAILURES, METRIC_RECORDS_FORWARDED, METRIC_RECORDS_PROCESSED_LOCALLY,
};

/// Routes the records of one processor of one pipeline to the peers owning them.
pub struct RemotePeerForwarder {
    pipeline: String,
    plugin_id: String,
    keys: IdentificationKeys,
    ring: Arc<PeerRing>,
    client: Arc<PeerForwarderClient>,
    /// The ring endpoint under which this node appears.
    local_address: String,
    receive_buffer: Arc<BoundedBuffer>,
    forwarding_batch_size: usize,
    shutting_down: AtomicBool,
}

impl RemotePeerForwarder {
    /// Create a new instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: impl Into<String>, plugin_id: impl Into<String>, keys: IdentificationKeys, ring: Arc<PeerRing>, client: Arc<PeerForwarderClient>,
        local_address: impl Into<String>, receive_buffer: Arc<BoundedBuffer>, forwarding_batch_size: usize,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            plugin_id: plugin_id.into(),
            keys,
            ring,
            client,
            local_address: local_address.into(),
            receive_buffer,
            forwarding_batch_size: forwarding_batch_size.max(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// The receive buffer staging records forwarded to this processor by peers.
    pub fn receive_buffer(&self) -> &Arc<BoundedBuffer> {
        &self.receive_buffer
    }

    /// Forward every record owned by a peer to that peer.
    ///
    /// Returns the records to process locally: those owned by this node, and those which could
    /// not be forwarded. Once shutdown has been prepared, nothing is forwarded anymore.
    #[tracing::instrument(level = "trace", skip(self, records), fields(pipeline = %self.pipeline, plugin = %self.plugin_id, count = records.len()))]
    pub async fn forward_records(&self, records: Vec<Record>) -> Vec<Record> {
        if records.is_empty() || self.shutting_down.load(Ordering::Acquire) {
            return records;
        }

        let ring = self.ring.load();
        let mut local = Vec::with_capacity(records.len());
        let mut remote: HashMap<&str, Vec<Record>> = HashMap::new();
        for record in records {
            let hash = self.keys.hash(record.event());
            let owner = ring.get(&hash.to_be_bytes());
            if owner == self.local_address {
                local.push(record);
            } else {
                remote.entry(owner).or_default().push(record);
            }
        }
        if !local.is_empty() {
            metrics::counter!(METRIC_RECORDS_PROCESSED_LOCALLY, "pipeline" => self.pipeline.clone()).increment(local.len() as u64);
        }

        let sends = remote.into_iter().map(|(endpoint, records)| self.forward_to_peer(endpoint, records));
        for failed in futures::future::join_all(sends).await {
            local.extend(failed);
        }
        local
    }

    /// Send records to one peer in chunks, returning the records of every chunk not admitted.
    async fn forward_to_peer(&self, endpoint: &str, records: Vec<Record>) -> Vec<Record> {
        let mut failed = vec![];
        for chunk in records.chunks(self.forwarding_batch_size) {
            let request = ForwardingRequest {
                destination_pipeline_name: self.pipeline.clone(),
                destination_plugin_id: self.plugin_id.clone(),
                events: chunk.iter().map(|record| record.event().clone()).collect(),
            };
            let response = self.client.forward(endpoint, &request).await;
            if response.is_success() {
                metrics::counter!(METRIC_RECORDS_FORWARDED, "pipeline" => self.pipeline.clone()).increment(chunk.len() as u64);
            } else {
                tracing::warn!(
                    endpoint, status = %response.status(), count = chunk.len(), pipeline = %self.pipeline,
                    "forwarding to peer failed, processing records locally"
                );
                metrics::counter!(METRIC_FORWARDING_FAILURES, "pipeline" => self.pipeline.clone()).increment(chunk.len() as u64);
                failed.extend_from_slice(chunk);
            }
        }
        failed
    }

    /// Drain the records peers have forwarded to this node so far, without waiting.
    pub async fn receive_records(&self) -> Result<Vec<Record>> {
        let (records, state) = self.receive_buffer.read(Duration::ZERO).await;
        self.receive_buffer.checkpoint(state).context("error checkpointing receive buffer")?;
        Ok(records)
    }

    /// Stop forwarding: from now on every record is processed locally.
    pub fn prepare_for_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Check if every record received from peers has been drained.
    pub fn is_receive_buffer_empty(&self) -> bool {
        self.receive_buffer.is_empty()
    }
}
