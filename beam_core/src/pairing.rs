//! Short-code pairing between two devices.
//!
//! The device that did NOT initiate mints the code and displays it; the
//! initiating user types it in. One attempt is live at a time.

use crate::{BeamError, Result};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    /// Responder: we minted `code` and wait for the peer to submit it
    AwaitingRemoteEntry { peer: SocketAddr, code: String },
    /// Initiator: the user must type the code shown on `peer`
    AwaitingLocalEntry { peer: SocketAddr },
    /// Initiator: code submitted, waiting for the peer's verdict
    Verifying { peer: SocketAddr },
    Authenticated { peer: SocketAddr },
}

/// Uniformly random 4-digit code, `0000` to `9999`.
pub fn generate_verification_code() -> String {
    let code: u16 = rand::rng().random_range(0..=9999);
    format!("{:04}", code)
}

/// Tracks the live pairing attempt.
pub struct PairingManager {
    state: Mutex<PairingState>,
}

impl Default for PairingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PairingState::Idle),
        }
    }

    pub fn state(&self) -> PairingState {
        self.state.lock().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(*self.state.lock(), PairingState::Authenticated { .. })
    }

    /// Responder path: mint a fresh code for `peer`, replacing any earlier attempt.
    pub fn generate_code(&self, peer: SocketAddr) -> String {
        let code = generate_verification_code();
        self.present_code(peer, code.clone());
        code
    }

    /// Responder path with a caller-chosen code.
    pub fn present_code(&self, peer: SocketAddr, code: String) {
        tracing::info!("Pairing requested by {}", peer);
        *self.state.lock() = PairingState::AwaitingRemoteEntry { peer, code };
    }

    /// Initiator path: the user will type the code displayed on `peer`.
    pub fn initiate(&self, peer: SocketAddr) {
        tracing::info!("Pairing with {}", peer);
        *self.state.lock() = PairingState::AwaitingLocalEntry { peer };
    }

    /// Responder-side check of a code submitted from `from`. The code is
    /// single-use: success authenticates, a mismatch ends the attempt.
    ///
    /// A submission from any host other than the attempt's peer is refused
    /// and leaves the attempt untouched.
    pub fn verify_local_code(&self, from: SocketAddr, candidate: &str) -> Result<SocketAddr> {
        let mut state = self.state.lock();
        let PairingState::AwaitingRemoteEntry { peer, code } = &*state else {
            return Err(BeamError::NoPairingAttempt);
        };
        let peer = *peer;

        if from.ip() != peer.ip() {
            tracing::warn!("Ignoring pairing code from {} during attempt with {}", from, peer);
            return Err(BeamError::ForeignPairingSource(from));
        }

        if candidate.trim() == code.as_str() {
            tracing::info!("Pairing with {} authenticated", peer);
            *state = PairingState::Authenticated { peer };
            Ok(peer)
        } else {
            tracing::warn!("Pairing code mismatch from {}", peer);
            *state = PairingState::Idle;
            Err(BeamError::PairingMismatch)
        }
    }

    /// Initiator: the typed code is about to be sent.
    pub fn begin_verifying(&self) -> Result<SocketAddr> {
        let mut state = self.state.lock();
        match &*state {
            PairingState::AwaitingLocalEntry { peer } => {
                let peer = *peer;
                *state = PairingState::Verifying { peer };
                Ok(peer)
            }
            _ => Err(BeamError::NoPairingAttempt),
        }
    }

    /// Initiator: record the peer's verdict on our code.
    pub fn finish_verifying(&self, accepted: bool) -> Result<SocketAddr> {
        let mut state = self.state.lock();
        let PairingState::Verifying { peer } = &*state else {
            return Err(BeamError::NoPairingAttempt);
        };
        let peer = *peer;

        if accepted {
            *state = PairingState::Authenticated { peer };
            Ok(peer)
        } else {
            *state = PairingState::Idle;
            Err(BeamError::PairingMismatch)
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = PairingState::Idle;
    }
}

/// Decides whether an inbound connection skips the approval prompt.
pub trait TrustPolicy: Send + Sync {
    fn is_trusted(&self, ip: IpAddr) -> bool;
}

/// Endpoints that completed pairing this session, keyed by IP so trust
/// survives a peer reappearing under a new radio id.
#[derive(Default)]
pub struct TrustedEndpoints {
    ips: RwLock<HashSet<IpAddr>>,
}

impl TrustedEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if already trusted.
    pub fn trust(&self, ip: IpAddr) -> bool {
        self.ips.write().insert(ip)
    }

    pub fn clear(&self) {
        self.ips.write().clear();
    }
}

impl TrustPolicy for TrustedEndpoints {
    fn is_trusted(&self, ip: IpAddr) -> bool {
        self.ips.read().contains(&ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.168.1.5:40000".parse().unwrap()
    }

    #[test]
    fn test_verification_code_format() {
        for _ in 0..100 {
            let code = generate_verification_code();
            assert_eq!(code.len(), 4);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_responder_accepts_matching_code() {
        let pairing = PairingManager::new();
        pairing.present_code(addr(), "4821".to_string());

        assert_eq!(pairing.verify_local_code(addr(), "4821").unwrap(), addr());
        assert!(pairing.is_authenticated());
    }

    #[test]
    fn test_mismatch_ends_attempt() {
        let pairing = PairingManager::new();
        pairing.present_code(addr(), "4821".to_string());

        assert!(matches!(
            pairing.verify_local_code(addr(), "0000"),
            Err(BeamError::PairingMismatch)
        ));
        assert_eq!(pairing.state(), PairingState::Idle);

        // Code is single-use, retrying the right one needs a new attempt
        assert!(matches!(
            pairing.verify_local_code(addr(), "4821"),
            Err(BeamError::NoPairingAttempt)
        ));
    }

    #[test]
    fn test_code_from_other_host_keeps_attempt() {
        let pairing = PairingManager::new();
        pairing.present_code(addr(), "4821".to_string());
        let stranger: SocketAddr = "192.168.1.99:40000".parse().unwrap();

        assert!(matches!(
            pairing.verify_local_code(stranger, "4821"),
            Err(BeamError::ForeignPairingSource(_))
        ));
        assert_eq!(
            pairing.state(),
            PairingState::AwaitingRemoteEntry {
                peer: addr(),
                code: "4821".to_string()
            }
        );

        // Same host, different reply port, still counts as the peer
        let same_host: SocketAddr = "192.168.1.5:41000".parse().unwrap();
        assert_eq!(pairing.verify_local_code(same_host, "4821").unwrap(), addr());
    }

    #[test]
    fn test_initiator_flow() {
        let pairing = PairingManager::new();
        assert!(pairing.begin_verifying().is_err());

        pairing.initiate(addr());
        assert_eq!(pairing.begin_verifying().unwrap(), addr());
        assert_eq!(pairing.state(), PairingState::Verifying { peer: addr() });

        pairing.finish_verifying(true).unwrap();
        assert!(pairing.is_authenticated());

        pairing.reset();
        assert_eq!(pairing.state(), PairingState::Idle);
    }

    #[test]
    fn test_trusted_endpoints() {
        let trusted = TrustedEndpoints::new();
        let ip = addr().ip();
        assert!(!trusted.is_trusted(ip));
        assert!(trusted.trust(ip));
        assert!(!trusted.trust(ip));
        assert!(trusted.is_trusted(ip));

        trusted.clear();
        assert!(!trusted.is_trusted(ip));
    }
}
