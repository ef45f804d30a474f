use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod config;
pub mod discovery;
pub mod error;
pub mod history;
pub mod pairing;
pub mod peer;
pub mod session;
pub mod transfer;

pub use error::{BeamError, Result};
pub use peer::Peer;
pub use session::Session;

use config::{AppConfig, LocalIdentity};
use discovery::{Radio, UdpRadio};
use transfer::{Direction, TransferRequest};

/// Requests from the UI to the backend.
#[derive(Debug, Clone)]
pub enum AppCommand {
    /// Bind the listener and start discovery
    Start,
    Stop,
    /// Re-issue advertise/scan after the radio was off
    RetryRadio,
    SendFiles {
        peer_id: String,
        files: Vec<PathBuf>,
    },
    RespondTransferRequest {
        request_id: String,
        accepted: bool,
    },
    /// Ask a peer to display a pairing code
    InitiatePairing {
        peer_id: String,
    },
    /// User typed the code shown on the other device
    SubmitPairingCode {
        code: String,
    },
    CancelPairing,
    /// Abort running sends/receives and drop queued files
    CancelTransfers,
    AddManualPeer {
        ip: IpAddr,
        port: u16,
        name: String,
    },
}

/// Reports from the backend to the UI.
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(String),
    Error(String),

    ListenerReady {
        addr: SocketAddr,
        advertised: SocketAddr,
    },

    /// Advertising or scanning could not start; retry with `RetryRadio`
    RadioUnavailable(String),

    PeersChanged(Vec<Peer>),

    /// Inbound offer waiting for accept/decline
    TransferRequest(TransferRequest),
    TransferRequestWithdrawn {
        request_id: String,
    },

    TransferStarted {
        id: String,
        file_name: String,
        declared_size: u64,
        direction: Direction,
        peer: SocketAddr,
    },
    TransferProgress {
        id: String,
        direction: Direction,
        transferred: u64,
        percent: f32,
    },
    TransferSpeed {
        id: String,
        direction: Direction,
        bytes_per_sec: f64,
        speed: String,
        eta: String,
    },
    TransferCompleted {
        id: String,
        direction: Direction,
        file_name: String,
        saved_path: Option<PathBuf>,
        /// Sender closed before the declared size
        truncated: bool,
    },
    TransferDeclined {
        id: String,
        direction: Direction,
        file_name: String,
    },
    TransferFailed {
        id: String,
        direction: Direction,
        file_name: String,
        error: String,
    },
    TransferCancelled {
        id: String,
        direction: Direction,
        file_name: String,
    },

    /// Responder: display this code
    ShowPairingCode {
        code: String,
        from: SocketAddr,
    },
    /// Initiator: ask the user for the code shown on `peer`
    RequestPairingCode {
        peer: SocketAddr,
    },
    PairingResult {
        success: bool,
        peer: SocketAddr,
        message: String,
    },
}

pub async fn run_backend(cmd_rx: mpsc::Receiver<AppCommand>, event_tx: mpsc::Sender<AppEvent>) {
    let config = AppConfig::load();
    let identity = LocalIdentity::load(&config);
    let radio: Arc<dyn Radio> = Arc::new(UdpRadio::new(
        identity.device_id.clone(),
        config.discovery_port,
    ));
    run_backend_with(config, identity, radio, cmd_rx, event_tx).await;
}

/// Command loop over an explicit config and radio.
pub async fn run_backend_with(
    config: AppConfig,
    identity: LocalIdentity,
    radio: Arc<dyn Radio>,
    mut cmd_rx: mpsc::Receiver<AppCommand>,
    event_tx: mpsc::Sender<AppEvent>,
) {
    let _ = event_tx
        .send(AppEvent::Status(format!(
            "Device ID: {}, Name: {}",
            identity.device_id, identity.device_name
        )))
        .await;

    let session = Arc::new(Session::new(config, identity, radio, event_tx.clone()));

    // Main loop: Wait for commands from UI
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            AppCommand::Start => {
                if let Err(e) = session.start().await {
                    tracing::error!("Failed to start: {}", e);
                    let _ = event_tx
                        .send(AppEvent::Error(format!("Cannot start listener: {}", e)))
                        .await;
                }
            }
            AppCommand::Stop => session.stop().await,
            AppCommand::RetryRadio => {
                if session.restart_discovery().await.is_ok() {
                    let _ = event_tx
                        .send(AppEvent::Status("Discovery running".to_string()))
                        .await;
                }
            }
            AppCommand::SendFiles { peer_id, files } => {
                if let Err(e) = session.send_files(&peer_id, files) {
                    let _ = event_tx
                        .send(AppEvent::Error(format!("Cannot send files: {}", e)))
                        .await;
                }
            }
            AppCommand::RespondTransferRequest {
                request_id,
                accepted,
            } => {
                let result = if accepted {
                    session.accept_request(&request_id).await
                } else {
                    session.decline_request(&request_id).await
                };
                if let Err(e) = result {
                    let _ = event_tx.send(AppEvent::Error(e.to_string())).await;
                }
            }
            AppCommand::InitiatePairing { peer_id } => {
                let session = session.clone();
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.initiate_pairing(&peer_id).await {
                        let _ = event_tx
                            .send(AppEvent::Error(format!("Pairing failed: {}", e)))
                            .await;
                    }
                });
            }
            AppCommand::SubmitPairingCode { code } => {
                let session = session.clone();
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    // Mismatches arrive as PairingResult; only transport errors land here
                    if let Err(e) = session.submit_pairing_code(&code).await {
                        let _ = event_tx
                            .send(AppEvent::Error(format!("Pairing failed: {}", e)))
                            .await;
                    }
                });
            }
            AppCommand::CancelPairing => session.cancel_pairing(),
            AppCommand::CancelTransfers => {
                session.cancel_transfers().await;
                let _ = event_tx
                    .send(AppEvent::Status("Transfers cancelled.".to_string()))
                    .await;
            }
            AppCommand::AddManualPeer { ip, port, name } => {
                session.add_manual_peer(ip, port, &name);
            }
        }
    }

    session.stop().await;
}
