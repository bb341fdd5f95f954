//! Device registry: peers found during the current scan cycle

use std::collections::HashSet;

use tokio::time::Instant;

use crate::adapter::{PeerEvent, ScanFilter};

/// A peer accepted into the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub last_seen: Instant,
}

/// Deduplicated set of discovered peers, in discovery order
///
/// An address is accepted at most once per cycle. Removing a peer (because we
/// connected to it) keeps its address in the seen set, so only [`clear`]
/// makes it discoverable again.
///
/// [`clear`]: DeviceRegistry::clear
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    filter: ScanFilter,
    peers: Vec<DiscoveredPeer>,
    seen: HashSet<String>,
}

impl DeviceRegistry {
    pub fn new(filter: ScanFilter) -> Self {
        Self { filter, peers: Vec::new(), seen: HashSet::new() }
    }

    /// Record an advertisement
    ///
    /// Returns the peer only the first time its address is accepted.
    pub fn insert(&mut self, event: PeerEvent, now: Instant) -> Option<DiscoveredPeer> {
        if !self.filter.matches(event.name.as_deref()) {
            return None;
        }

        if self.seen.contains(&event.address) {
            if let Some(peer) = self.peers.iter_mut().find(|p| p.address == event.address) {
                peer.last_seen = now;
                if event.rssi.is_some() {
                    peer.rssi = event.rssi;
                }
                if peer.name.is_none() {
                    peer.name = event.name;
                }
            }
            return None;
        }

        let peer = DiscoveredPeer {
            address: event.address,
            name: event.name,
            rssi: event.rssi,
            last_seen: now,
        };
        self.seen.insert(peer.address.clone());
        self.peers.push(peer.clone());
        Some(peer)
    }

    /// Drop a peer from the list without making it discoverable again
    pub fn remove(&mut self, address: &str) -> Option<DiscoveredPeer> {
        let index = self.peers.iter().position(|p| p.address == address)?;
        Some(self.peers.remove(index))
    }

    /// Start a new cycle
    pub fn clear(&mut self) {
        self.peers.clear();
        self.seen.clear();
    }

    /// Start a new cycle that admits peers through `filter`
    pub fn reset(&mut self, filter: ScanFilter) {
        self.filter = filter;
        self.clear();
    }

    pub fn get(&self, address: &str) -> Option<&DiscoveredPeer> {
        self.peers.iter().find(|p| p.address == address)
    }

    pub fn peers(&self) -> &[DiscoveredPeer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
