//! File transfer over raw TCP streams.
//!
//! This module provides:
//! - the `::`-delimited control-line protocol
//! - a listener that runs one `FileReceiver` per inbound connection
//! - a per-target FIFO send queue with chunked streaming
//! - the client side of the pairing messages

pub mod active;
pub mod constants;
pub mod hash;
pub mod pending;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod utils;

use crate::pairing::TrustPolicy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub use active::ActiveTransfers;
pub use pending::{Decision, PendingRequests};
pub use progress::SpeedSample;
pub use queue::{QueuedFile, SendQueue};
pub use receiver::FileReceiver;
pub use server::TransferServer;

/// One inbound file offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub request_id: String,
    /// Already sanitised
    pub file_name: String,
    /// As claimed by the sender, not verified
    pub declared_size: u64,
    pub peer: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Everything a receiver or the send queue reports back to the session.
#[derive(Debug)]
pub enum TransferEvent {
    Requested {
        request: TransferRequest,
        auto_accepted: bool,
    },
    /// The connection behind a pending request dropped before a decision
    RequestWithdrawn {
        request_id: String,
    },
    Started {
        id: String,
        file_name: String,
        declared_size: u64,
        direction: Direction,
        peer: SocketAddr,
    },
    Progress {
        id: String,
        direction: Direction,
        transferred: u64,
        percent: f32,
    },
    SpeedSample {
        id: String,
        direction: Direction,
        sample: SpeedSample,
    },
    Completed {
        id: String,
        direction: Direction,
        file_name: String,
        /// Final location for incoming files
        saved_path: Option<PathBuf>,
        transferred: u64,
        declared_size: u64,
        /// Peer closed before the declared size was reached
        truncated: bool,
    },
    Failed {
        id: String,
        direction: Direction,
        file_name: String,
        error: String,
    },
    Declined {
        id: String,
        direction: Direction,
        file_name: String,
        declared_size: u64,
    },
    Cancelled {
        id: String,
        direction: Direction,
        file_name: String,
    },
    /// `from` is the requester's IP with the reply port it advertised
    PairingRequested {
        from: SocketAddr,
    },
    /// The verdict is written back as `PAIR_ACK::` or `PAIR_FAIL::`
    PairingCodeSubmitted {
        from: SocketAddr,
        code: String,
        verdict: oneshot::Sender<bool>,
    },
}

/// Shared handles every receiver needs.
#[derive(Clone)]
pub struct ReceiverContext {
    pub download_dir: PathBuf,
    pub events: mpsc::Sender<TransferEvent>,
    pub pending: Arc<PendingRequests>,
    pub trust: Arc<dyn TrustPolicy>,
    pub active: Arc<ActiveTransfers>,
}
