//! The advertisement/scan facility, plus a LAN broadcast stand-in for it.

use crate::{BeamError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Magic bytes prefixed to every broadcast frame (6 bytes: "BEAM\0\x01")
pub const MAGIC_BYTES: &[u8] = b"BEAM\x00\x01";

/// How often an active advertisement is re-broadcast
pub const ADVERTISE_INTERVAL: Duration = Duration::from_secs(1);

const MAX_FRAME_LEN: usize = 2048;

/// What this device broadcasts under a service id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub local_name: String,
    pub service_data: Vec<u8>,
}

/// One sighting of a remote advertiser.
#[derive(Debug, Clone)]
pub struct Observation {
    pub radio_id: String,
    pub service_id: Uuid,
    pub local_name: Option<String>,
    pub service_data: Option<Vec<u8>>,
    /// Source address, when the medium exposes one
    pub source: Option<IpAddr>,
}

/// A short-range radio that can advertise a small payload and report others doing the same.
///
/// Implementations fail fast with [`BeamError::RadioUnavailable`] and never retry on their own.
pub trait Radio: Send + Sync {
    fn start_advertising(&self, service_id: Uuid, advertisement: Advertisement) -> Result<()>;

    /// Safe to call when not advertising.
    fn stop_advertising(&self);

    fn start_scanning(
        &self,
        service_id: Uuid,
        observations: mpsc::UnboundedSender<Observation>,
    ) -> Result<()>;

    fn stop_scanning(&self);
}

#[derive(Debug, Serialize, Deserialize)]
struct AdvertisementFrame {
    radio_id: String,
    service_id: Uuid,
    local_name: Option<String>,
    service_data: Option<Vec<u8>>,
}

impl AdvertisementFrame {
    fn to_packet(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut packet = MAGIC_BYTES.to_vec();
        packet.extend_from_slice(&json);
        Ok(packet)
    }

    /// None for foreign traffic or garbage.
    fn from_packet(packet: &[u8]) -> Option<Self> {
        let data = packet.strip_prefix(MAGIC_BYTES)?;
        serde_json::from_slice(data).ok()
    }
}

/// Emulates a radio advertisement with UDP broadcast on the local link.
pub struct UdpRadio {
    radio_id: String,
    port: u16,
    advertising: Mutex<Option<CancellationToken>>,
    scanning: Mutex<Option<CancellationToken>>,
}

impl UdpRadio {
    pub fn new(radio_id: impl Into<String>, port: u16) -> Self {
        Self {
            radio_id: radio_id.into(),
            port,
            advertising: Mutex::new(None),
            scanning: Mutex::new(None),
        }
    }

    fn bind(addr: SocketAddr, broadcast: bool) -> Result<UdpSocket> {
        let unavailable = |e: std::io::Error| {
            BeamError::RadioUnavailable(format!("cannot bind UDP {}: {}", addr, e))
        };
        let socket = std::net::UdpSocket::bind(addr).map_err(unavailable)?;
        socket.set_broadcast(broadcast).map_err(unavailable)?;
        socket.set_nonblocking(true).map_err(unavailable)?;
        UdpSocket::from_std(socket).map_err(unavailable)
    }
}

impl Radio for UdpRadio {
    fn start_advertising(&self, service_id: Uuid, advertisement: Advertisement) -> Result<()> {
        let socket = Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), true)?;
        let packet = AdvertisementFrame {
            radio_id: self.radio_id.clone(),
            service_id,
            local_name: Some(advertisement.local_name),
            service_data: Some(advertisement.service_data),
        }
        .to_packet()?;

        let token = CancellationToken::new();
        if let Some(previous) = self.advertising.lock().replace(token.clone()) {
            previous.cancel();
        }

        let target = SocketAddr::from((Ipv4Addr::BROADCAST, self.port));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ADVERTISE_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = socket.send_to(&packet, target).await {
                            tracing::debug!("Advertisement broadcast failed: {}", e);
                        }
                    }
                }
            }
        });

        tracing::debug!("UDP radio advertising on port {}", self.port);
        Ok(())
    }

    fn stop_advertising(&self) {
        if let Some(token) = self.advertising.lock().take() {
            token.cancel();
        }
    }

    fn start_scanning(
        &self,
        service_id: Uuid,
        observations: mpsc::UnboundedSender<Observation>,
    ) -> Result<()> {
        let socket = Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)), false)?;

        let token = CancellationToken::new();
        if let Some(previous) = self.scanning.lock().replace(token.clone()) {
            previous.cancel();
        }

        let own_id = self.radio_id.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_FRAME_LEN];
            loop {
                let (len, addr) = tokio::select! {
                    _ = token.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("UDP radio receive failed: {}", e);
                            break;
                        }
                    },
                };

                let Some(frame) = AdvertisementFrame::from_packet(&buf[..len]) else {
                    continue;
                };
                if frame.service_id != service_id || frame.radio_id == own_id {
                    continue;
                }

                let observation = Observation {
                    radio_id: frame.radio_id,
                    service_id: frame.service_id,
                    local_name: frame.local_name,
                    service_data: frame.service_data,
                    source: Some(addr.ip()),
                };
                if observations.send(observation).is_err() {
                    break;
                }
            }
        });

        tracing::debug!("UDP radio scanning on port {}", self.port);
        Ok(())
    }

    fn stop_scanning(&self) {
        if let Some(token) = self.scanning.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for UdpRadio {
    fn drop(&mut self) {
        self.stop_advertising();
        self.stop_scanning();
    }
}
