use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

use crate::buffer::BoundedBuffer;

/// The receive buffers of every peer-forwarded processor, by pipeline name then plugin ID.
pub type ReceiveBufferMap = HashMap<String, HashMap<String, Arc<BoundedBuffer>>>;

/// The receive buffers of this node.
///
/// Buffers are registered while pipelines are built. Freezing the registry hands out a read-only
/// map, after which no further buffers can be registered.
pub struct ReceiveBuffers {
    buffer_size: usize,
    batch_size: usize,
    building: Mutex<Option<ReceiveBufferMap>>,
}

impl ReceiveBuffers {
    /// Create a new instance whose buffers use the given capacity and read batch size.
    pub fn new(buffer_size: usize, batch_size: usize) -> Self {
        Self {
            buffer_size,
            batch_size,
            building: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Create and register the receive buffer of the given processor.
    pub fn register(&self, pipeline: &str, plugin_id: &str) -> Result<Arc<BoundedBuffer>> {
        let mut building = self.building.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let map = match building.as_mut() {
            Some(map) => map,
            None => bail!("receive buffer for {}/{} registered after the peer forwarding service has started", pipeline, plugin_id),
        };
        let plugins = map.entry(pipeline.to_string()).or_default();
        if plugins.contains_key(plugin_id) {
            bail!("a receive buffer for {}/{} is already registered", pipeline, plugin_id);
        }
        let buffer = Arc::new(BoundedBuffer::new(format!("{}/{}/receive", pipeline, plugin_id), self.buffer_size, self.batch_size)?);
        plugins.insert(plugin_id.to_string(), buffer.clone());
        Ok(buffer)
    }

    /// Freeze this registry, returning the final map of receive buffers.
    pub fn freeze(&self) -> Result<Arc<ReceiveBufferMap>> {
        let mut building = self.building.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match building.take() {
            Some(map) => Ok(Arc::new(map)),
            None => bail!("receive buffers have already been frozen"),
        }
    }
}
