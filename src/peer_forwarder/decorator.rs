use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::Record;
use crate::peer_forwarder::RemotePeerForwarder;
use crate::pipeline::Processor;

/// Wraps a keyed processor so that it only ever sees the records this node owns.
///
/// Records owned by peers are forwarded to them; the wrapped processor runs on the locally owned
/// records together with the records peers have forwarded to this node.
pub struct PeerForwardingProcessor {
    inner: Arc<dyn Processor>,
    forwarder: Arc<RemotePeerForwarder>,
}

impl PeerForwardingProcessor {
    /// Create a new instance.
    pub fn new(inner: Arc<dyn Processor>, forwarder: Arc<RemotePeerForwarder>) -> Self {
        Self { inner, forwarder }
    }
}

#[async_trait]
impl Processor for PeerForwardingProcessor {
    async fn execute(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        let mut local = self.forwarder.forward_records(records).await;
        local.extend(self.forwarder.receive_records().await?);
        self.inner.execute(local).await
    }

    fn prepare_for_shutdown(&self) {
        self.forwarder.prepare_for_shutdown();
        self.inner.prepare_for_shutdown();
    }

    fn is_ready_for_shutdown(&self) -> bool {
        self.forwarder.is_receive_buffer_empty() && self.inner.is_ready_for_shutdown()
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    fn identification_keys(&self) -> Option<Vec<String>> {
        self.inner.identification_keys()
    }

    fn process_empty_batches(&self) -> bool {
        true
    }
}
