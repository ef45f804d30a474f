use super::payload::EndpointPayload;
use super::radio::Observation;
use crate::peer::{Peer, UNKNOWN_PEER_NAME};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerFound(Peer),
    PeerUpdated(Peer),
    PeerLost(Peer),
}

/// The published peer list. Every mutation holds the lock, so radio
/// callbacks and the prune sweep never interleave.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<Vec<Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one radio sighting. Returns what changed, if anything worth publishing.
    pub fn observe(&self, observation: &Observation, now: Instant) -> Option<DiscoveryEvent> {
        let endpoint = observation
            .service_data
            .as_deref()
            .and_then(EndpointPayload::decode)
            .map(|p| p.socket_addr());
        let name = observation
            .local_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());

        let mut peers = self.peers.lock();
        let existing = peers
            .iter()
            .position(|p| p.id == observation.radio_id)
            .or_else(|| {
                let ip = endpoint?.ip();
                peers.iter().position(|p| p.ip() == Some(ip))
            });

        match existing {
            Some(index) => {
                let peer = &mut peers[index];
                peer.last_seen = now;
                let mut changed = false;
                if endpoint.is_some() && peer.endpoint != endpoint {
                    peer.endpoint = endpoint;
                    changed = true;
                }
                if let Some(name) = name {
                    if peer.display_name != name {
                        peer.display_name = name.to_string();
                        changed = true;
                    }
                }
                changed.then(|| DiscoveryEvent::PeerUpdated(peer.clone()))
            }
            None => {
                if endpoint.is_none() && name.is_none() {
                    return None;
                }
                let mut peer = Peer::new(observation.radio_id.clone(), now);
                peer.endpoint = endpoint;
                if let Some(name) = name {
                    peer.display_name = name.to_string();
                }
                tracing::info!("Peer found: {} ({:?})", peer.display_name, peer.endpoint);
                peers.push(peer.clone());
                Some(DiscoveryEvent::PeerFound(peer))
            }
        }
    }

    /// Evict untrusted peers not seen within `stale_after`.
    pub fn prune(&self, now: Instant, stale_after: Duration) -> Vec<Peer> {
        let mut peers = self.peers.lock();
        let mut lost = Vec::new();
        peers.retain(|peer| {
            if peer.trusted || !peer.is_stale(now, stale_after) {
                return true;
            }
            lost.push(peer.clone());
            false
        });
        for peer in &lost {
            tracing::info!("Peer lost: {} ({})", peer.display_name, peer.id);
        }
        lost
    }

    /// Insert or refresh a peer known by address rather than by radio.
    pub fn add_manual(&self, endpoint: SocketAddr, name: &str, now: Instant) -> DiscoveryEvent {
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.iter_mut().find(|p| p.ip() == Some(endpoint.ip())) {
            peer.endpoint = Some(endpoint);
            peer.last_seen = now;
            if peer.display_name == UNKNOWN_PEER_NAME && !name.is_empty() {
                peer.display_name = name.to_string();
            }
            return DiscoveryEvent::PeerUpdated(peer.clone());
        }

        let mut peer = Peer::new(uuid::Uuid::new_v4().to_string(), now);
        peer.endpoint = Some(endpoint);
        if !name.is_empty() {
            peer.display_name = name.to_string();
        }
        peers.push(peer.clone());
        DiscoveryEvent::PeerFound(peer)
    }

    /// Flag every peer at `ip` as trusted.
    pub fn mark_trusted(&self, ip: IpAddr) -> Vec<Peer> {
        let mut peers = self.peers.lock();
        peers
            .iter_mut()
            .filter(|p| p.ip() == Some(ip))
            .map(|p| {
                p.trusted = true;
                p.clone()
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers.lock().iter().find(|p| p.id == id).cloned()
    }

    pub fn find_by_ip(&self, ip: IpAddr) -> Option<Peer> {
        self.peers.lock().iter().find(|p| p.ip() == Some(ip)).cloned()
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.lock().clone()
    }

    pub fn clear(&self) {
        self.peers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    fn sighting(id: &str, name: Option<&str>, endpoint: Option<(Ipv4Addr, u16)>) -> Observation {
        Observation {
            radio_id: id.to_string(),
            service_id: Uuid::nil(),
            local_name: name.map(str::to_string),
            service_data: endpoint.map(|(ip, port)| EndpointPayload::new(ip, port).encode().to_vec()),
            source: None,
        }
    }

    #[test]
    fn test_nameless_payloadless_is_ignored() {
        let registry = PeerRegistry::new();
        assert_eq!(registry.observe(&sighting("r1", None, None), Instant::now()), None);
        assert_eq!(registry.observe(&sighting("r1", Some("  "), None), Instant::now()), None);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_reobservation_keeps_known_endpoint() {
        let registry = PeerRegistry::new();
        let now = Instant::now();
        let ip = Ipv4Addr::new(192, 168, 0, 9);

        let found = registry.observe(&sighting("r1", None, Some((ip, 4000))), now);
        assert!(matches!(found, Some(DiscoveryEvent::PeerFound(_))));

        let renamed = registry.observe(&sighting("r1", Some("Phone"), None), now);
        match renamed {
            Some(DiscoveryEvent::PeerUpdated(peer)) => {
                assert_eq!(peer.display_name, "Phone");
                assert_eq!(peer.endpoint, Some(SocketAddr::from((ip, 4000))));
            }
            other => panic!("unexpected {:?}", other),
        }

        // Identical sighting only refreshes last_seen
        assert_eq!(registry.observe(&sighting("r1", Some("Phone"), None), now), None);
    }

    #[test]
    fn test_merge_by_ip_under_new_radio_id() {
        let registry = PeerRegistry::new();
        let now = Instant::now();
        let ip = Ipv4Addr::new(10, 0, 0, 5);

        registry.observe(&sighting("old", Some("Tablet"), Some((ip, 4000))), now);
        let event = registry.observe(&sighting("new", None, Some((ip, 4001))), now);

        assert!(matches!(event, Some(DiscoveryEvent::PeerUpdated(_))));
        let peers = registry.snapshot();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].endpoint.map(|e| e.port()), Some(4001));
    }

    #[test]
    fn test_prune_spares_trusted_peers() {
        let registry = PeerRegistry::new();
        let start = Instant::now();
        registry.observe(&sighting("a", Some("A"), Some((Ipv4Addr::new(10, 0, 0, 1), 1))), start);
        registry.observe(&sighting("b", Some("B"), Some((Ipv4Addr::new(10, 0, 0, 2), 1))), start);
        registry.mark_trusted(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

        let later = start + Duration::from_secs(11);
        let lost = registry.prune(later, Duration::from_secs(10));
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].id, "a");
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_manual_peer_merges_by_ip() {
        let registry = PeerRegistry::new();
        let now = Instant::now();
        let addr: SocketAddr = "192.168.1.30:5000".parse().unwrap();

        assert!(matches!(
            registry.add_manual(addr, "Paired Device", now),
            DiscoveryEvent::PeerFound(_)
        ));
        assert!(matches!(
            registry.add_manual("192.168.1.30:5001".parse().unwrap(), "", now),
            DiscoveryEvent::PeerUpdated(_)
        ));
        let peer = registry.find_by_ip(addr.ip()).unwrap();
        assert_eq!(peer.display_name, "Paired Device");
        assert_eq!(peer.endpoint.map(|e| e.port()), Some(5001));

        registry.mark_trusted(addr.ip());
        registry.clear();
        assert!(registry.snapshot().is_empty());
        assert!(registry.find_by_ip(addr.ip()).is_none());
    }
}
