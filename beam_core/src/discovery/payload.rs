//! Advertisement service data: where a peer's transfer listener lives.
//!
//! Layout is 4 bytes of IPv4 address followed by a big-endian port, small
//! enough for a radio advertisement packet.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const PAYLOAD_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointPayload {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl EndpointPayload {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let mut out = [0u8; PAYLOAD_LEN];
        out[..4].copy_from_slice(&self.ip.octets());
        out[4..].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    /// Returns None for anything shorter than six bytes; extra bytes are ignored.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < PAYLOAD_LEN {
            return None;
        }
        let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let port = u16::from_be_bytes([data[4], data[5]]);
        Some(Self { ip, port })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl From<SocketAddrV4> for EndpointPayload {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let payload = EndpointPayload::new(Ipv4Addr::new(192, 168, 1, 42), 0x1F90);
        assert_eq!(payload.encode(), [192, 168, 1, 42, 0x1F, 0x90]);
    }

    #[test]
    fn test_decode_rejects_short_data() {
        assert_eq!(EndpointPayload::decode(&[]), None);
        assert_eq!(EndpointPayload::decode(&[10, 0, 0, 1, 0x1F]), None);
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let decoded = EndpointPayload::decode(&[10, 0, 0, 7, 0x00, 0x50, 0xFF]).unwrap();
        assert_eq!(decoded.socket_addr(), "10.0.0.7:80".parse().unwrap());
    }
}
