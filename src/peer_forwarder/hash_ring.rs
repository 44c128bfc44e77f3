use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;

use crate::error::AppError;

/// An immutable consistent hash ring over a set of peer endpoints.
///
/// Each endpoint is placed on the ring at `virtual_nodes` points. A key is owned by the endpoint
/// of the first point at or after the key's hash, wrapping around at the end of the ring.
#[derive(Debug)]
pub struct HashRing {
    points: BTreeMap<u64, usize>,
    endpoints: Vec<String>,
}

impl HashRing {
    /// Create a new instance.
    ///
    /// Endpoint order and duplicates do not affect the resulting mapping.
    pub fn new<I, S>(endpoints: I, virtual_nodes: u32) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints: Vec<String> = endpoints.into_iter().map(Into::into).collect::<BTreeSet<_>>().into_iter().collect();
        if endpoints.is_empty() {
            return Err(AppError::InvalidConfig("a hash ring requires at least one peer endpoint".into()).into());
        }
        if virtual_nodes == 0 {
            return Err(AppError::InvalidConfig("a hash ring requires at least one virtual node per endpoint".into()).into());
        }

        let mut points = BTreeMap::new();
        for (idx, endpoint) in endpoints.iter().enumerate() {
            for vnode in 0..virtual_nodes {
                let point = seahash::hash(format!("{}-{}", endpoint, vnode).as_bytes());
                points.entry(point).or_insert(idx);
            }
        }
        Ok(Self { points, endpoints })
    }

    /// The endpoint owning the given key.
    pub fn get(&self, key: &[u8]) -> &str {
        let hash = seahash::hash(key);
        let idx = self
            .points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, idx)| *idx)
            .unwrap_or_default();
        &self.endpoints[idx]
    }

    /// The sorted, de-duplicated endpoints of this ring.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

/// The current hash ring of the fleet, replaced wholesale whenever the peer list changes.
///
/// Lookups racing with a rebuild may observe either ring.
pub struct PeerRing {
    ring: ArcSwap<HashRing>,
    virtual_nodes: u32,
}

impl PeerRing {
    /// Create a new instance from the initial peer list.
    pub fn new<I, S>(endpoints: I, virtual_nodes: u32) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self {
            ring: ArcSwap::from_pointee(HashRing::new(endpoints, virtual_nodes)?),
            virtual_nodes,
        })
    }

    /// A snapshot of the current ring.
    pub fn load(&self) -> Arc<HashRing> {
        self.ring.load_full()
    }

    /// Rebuild the ring from the given peer list, if it differs from the current one.
    ///
    /// Returns `true` if the ring was replaced.
    pub fn rebuild(&self, endpoints: Vec<String>) -> Result<bool> {
        let ring = HashRing::new(endpoints, self.virtual_nodes)?;
        if ring.endpoints() == self.ring.load().endpoints() {
            return Ok(false);
        }
        tracing::info!(endpoints = ?ring.endpoints(), "peer list changed, hash ring rebuilt");
        self.ring.store(Arc::new(ring));
        Ok(true)
    }
}
