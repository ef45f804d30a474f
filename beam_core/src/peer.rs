use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

pub const UNKNOWN_PEER_NAME: &str = "Unknown";
pub const PAIRED_PEER_NAME: &str = "Paired Device";

/// A device seen over the radio or added by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Radio-layer id, or a generated UUID for manual peers
    pub id: String,
    pub display_name: String,
    /// Where its transfer listener can be dialed
    pub endpoint: Option<SocketAddr>,
    /// Set only by a successful pairing handshake
    pub trusted: bool,
    pub last_seen: Instant,
}

impl Peer {
    pub fn new(id: impl Into<String>, now: Instant) -> Self {
        Self {
            id: id.into(),
            display_name: UNKNOWN_PEER_NAME.to_string(),
            endpoint: None,
            trusted: false,
            last_seen: now,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.endpoint.map(|addr| addr.ip())
    }

    pub fn is_stale(&self, now: Instant, stale_after: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > stale_after
    }

    /// Label for logs and the UI: name, falling back to the address.
    pub fn label(&self) -> String {
        match (&self.display_name[..], self.endpoint) {
            (UNKNOWN_PEER_NAME, Some(addr)) => addr.to_string(),
            (name, _) => name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_threshold() {
        let start = Instant::now();
        let peer = Peer::new("radio-1", start);

        assert!(!peer.is_stale(start + Duration::from_secs(10), Duration::from_secs(10)));
        assert!(peer.is_stale(start + Duration::from_secs(11), Duration::from_secs(10)));
        // Clock earlier than last_seen never counts as stale
        assert!(!peer.is_stale(start, Duration::ZERO));
    }

    #[test]
    fn test_label_falls_back_to_endpoint() {
        let mut peer = Peer::new("radio-1", Instant::now());
        assert_eq!(peer.label(), "Unknown");

        peer.endpoint = Some("192.168.1.20:4000".parse().unwrap());
        assert_eq!(peer.label(), "192.168.1.20:4000");

        peer.display_name = "Laptop".to_string();
        assert_eq!(peer.label(), "Laptop");
    }
}
