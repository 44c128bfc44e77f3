use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::buffer::Buffer;
use crate::model::{IdentificationKeys, Record};
use crate::peer_forwarder::fixtures::{self, TestNode};
use crate::peer_forwarder::{HashRing, PeerForwardingProcessor};
use crate::pipeline::Processor;

/// Start a fleet of two nodes, returning them along with the fleet's endpoints.
async fn start_fleet() -> Result<(TestNode, TestNode, Vec<String>)> {
    let ((listener_a, addr_a), (listener_b, addr_b)) = (fixtures::listener().await?, fixtures::listener().await?);
    let endpoints = vec![addr_a.clone(), addr_b.clone()];
    let node_a = TestNode::start(listener_a, fixtures::node_config(&addr_a, &endpoints, 256, 2000)?).await?;
    let node_b = TestNode::start(listener_b, fixtures::node_config(&addr_b, &endpoints, 256, 2000)?).await?;
    Ok((node_a, node_b, endpoints))
}

fn records_by_key(count: usize) -> Vec<Record> {
    (0..count).map(|seq| fixtures::keyed_record(&format!("key-{}", seq), seq)).collect()
}

fn owner<'a>(ring: &'a HashRing, keys: &IdentificationKeys, record: &Record) -> &'a str {
    ring.get(&keys.hash(record.event()).to_be_bytes())
}

#[tokio::test]
async fn records_are_split_between_local_and_owning_peer() -> Result<()> {
    let (node_a, node_b, endpoints) = start_fleet().await?;
    let (ring, keys) = (HashRing::new(endpoints, 128)?, IdentificationKeys::new(vec!["key".into()])?);
    let input = records_by_key(100);
    let expected_remote = input.iter().filter(|rec| owner(&ring, &keys, rec) == node_b.address).count();
    assert!(expected_remote > 0 && expected_remote < 100, "expected keys to be spread across both nodes");

    let local = node_a.forwarder.forward_records(input).await;

    assert_eq!(local.len(), 100 - expected_remote, "expected locally owned records to be returned");
    assert!(local.iter().all(|rec| owner(&ring, &keys, rec) == node_a.address), "expected only records owned by this node to be returned");
    assert_eq!(node_b.service.received(), expected_remote as u64, "expected the peer to receive every record it owns");
    let received = node_b.forwarder.receive_records().await?;
    assert_eq!(received.len(), expected_remote, "expected forwarded records in the peer's receive buffer");
    assert!(received.iter().all(|rec| owner(&ring, &keys, rec) == node_b.address), "expected the peer to only receive records it owns");

    node_a.stop().await?;
    node_b.stop().await
}

#[tokio::test]
async fn unreachable_peer_falls_back_to_local_processing() -> Result<()> {
    let (listener, address) = fixtures::listener().await?;
    let dead_peer = "127.0.0.1:1".to_string();
    let node = TestNode::start(listener, fixtures::node_config(&address, &[address.clone(), dead_peer], 256, 2000)?).await?;
    let input = records_by_key(50);

    let local = node.forwarder.forward_records(input).await;

    assert_eq!(local.len(), 50, "expected every record to be processed locally, got {}", local.len());
    node.stop().await
}

#[tokio::test]
async fn nothing_is_forwarded_after_prepare_for_shutdown() -> Result<()> {
    let (node_a, node_b, _) = start_fleet().await?;
    node_a.forwarder.prepare_for_shutdown();

    let local = node_a.forwarder.forward_records(records_by_key(50)).await;

    assert_eq!(local.len(), 50, "expected every record to be processed locally");
    assert_eq!(node_b.service.received(), 0, "expected the peer to receive nothing");
    node_a.stop().await?;
    node_b.stop().await
}

#[tokio::test]
async fn forwarding_is_chunked_by_forwarding_batch_size() -> Result<()> {
    let ((listener_a, addr_a), (listener_b, addr_b)) = (fixtures::listener().await?, fixtures::listener().await?);
    let endpoints = vec![addr_a.clone(), addr_b.clone()];
    let mut config_a = crate::config::Config::clone(&*fixtures::node_config(&addr_a, &endpoints, 256, 2000)?);
    config_a.peer_forwarder_forwarding_batch_size = 3;
    let node_a = TestNode::start(listener_a, Arc::new(config_a)).await?;
    // A single request carrying all six records could never fit the peer's receive buffer.
    let node_b = TestNode::start(listener_b, fixtures::node_config(&addr_b, &endpoints, 4, 2000)?).await?;
    let (ring, keys) = (HashRing::new(endpoints, 128)?, IdentificationKeys::new(vec!["key".into()])?);
    let remote: Vec<Record> = records_by_key(500).into_iter().filter(|rec| owner(&ring, &keys, rec) == addr_b).take(6).collect();
    assert_eq!(remote.len(), 6, "expected enough records owned by the peer");
    let (drainer, done) = (node_b.forwarder.clone(), Arc::new(AtomicBool::new(false)));
    let drain_done = done.clone();
    let drain = tokio::spawn(async move {
        let mut drained = 0;
        while !drain_done.load(Ordering::SeqCst) {
            drained += drainer.receive_records().await?.len();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drained += drainer.receive_records().await?.len();
        Ok::<_, anyhow::Error>(drained)
    });

    let local = node_a.forwarder.forward_records(remote).await;
    done.store(true, Ordering::SeqCst);
    let drained = drain.await.context("error joining drain task")??;

    assert!(local.is_empty(), "expected every chunk to be admitted, {} returned", local.len());
    assert_eq!(node_b.service.received(), 6, "expected the peer to receive both chunks");
    assert_eq!(drained, 6, "expected the peer to drain every forwarded record");
    node_a.stop().await?;
    node_b.stop().await
}

/// A processor recording every record it sees.
#[derive(Default)]
struct RecordingProcessor {
    seen: Mutex<Vec<Record>>,
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn execute(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).extend(records.iter().cloned());
        Ok(records)
    }

    fn identification_keys(&self) -> Option<Vec<String>> {
        Some(vec!["key".into()])
    }
}

#[tokio::test]
async fn decorated_processor_sees_local_and_received_records() -> Result<()> {
    let (node_a, node_b, endpoints) = start_fleet().await?;
    let (ring, keys) = (HashRing::new(endpoints, 128)?, IdentificationKeys::new(vec!["key".into()])?);
    let inner = Arc::new(RecordingProcessor::default());
    let decorated = PeerForwardingProcessor::new(inner.clone(), node_a.forwarder.clone());
    let from_peer = node_b.forwarder.forward_records(records_by_key(100)).await;
    let forwarded_to_a = 100 - from_peer.len();
    assert!(!decorated.is_ready_for_shutdown(), "expected pending received records to block shutdown");

    let output = decorated.execute(vec![]).await?;

    assert_eq!(output.len(), forwarded_to_a, "expected received records to be processed");
    let seen = inner.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
    assert!(seen.iter().all(|rec| owner(&ring, &keys, rec) == node_a.address), "expected only records owned by this node");
    assert!(decorated.is_ready_for_shutdown(), "expected the decorator to be ready once drained");
    assert!(decorated.process_empty_batches(), "expected the decorator to run on empty batches");
    assert_eq!(decorated.identification_keys(), Some(vec!["key".to_string()]), "expected identification keys of the inner processor");
    assert!(node_a.forwarder.receive_buffer().is_empty(), "expected the receive buffer to be drained");
    node_a.stop().await?;
    node_b.stop().await
}
