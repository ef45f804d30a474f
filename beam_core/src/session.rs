//! Composition root: discovery, pairing, the listener, the send queue and history.

use crate::config::{AppConfig, LocalIdentity};
use crate::discovery::{Discovery, DiscoveryEvent, EndpointPayload, Radio};
use crate::history::{TransferHistory, TransferHistoryItem, TransferState};
use crate::pairing::{PairingManager, PairingState, TrustPolicy, TrustedEndpoints};
use crate::peer::{PAIRED_PEER_NAME, Peer};
use crate::transfer::progress::{format_eta, format_speed};
use crate::transfer::receiver::clear_staging;
use crate::transfer::{
    ActiveTransfers, Decision, PendingRequests, QueuedFile, ReceiverContext, SendQueue,
    TransferEvent, TransferRequest, TransferServer, sender,
};
use crate::{AppEvent, BeamError, Result};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TRANSFER_EVENT_CAPACITY: usize = 256;

struct Listener {
    token: CancellationToken,
    local_addr: SocketAddr,
    advertised: EndpointPayload,
}

struct SessionInner {
    config: AppConfig,
    identity: LocalIdentity,
    discovery: Discovery,
    pairing: PairingManager,
    trusted: Arc<TrustedEndpoints>,
    pending: Arc<PendingRequests>,
    active: Arc<ActiveTransfers>,
    queue: SendQueue,
    history: TransferHistory,
    transfer_tx: mpsc::Sender<TransferEvent>,
    app_events: mpsc::Sender<AppEvent>,
    lifetime: CancellationToken,
    listener: Mutex<Option<Listener>>,
}

/// One running node. Dropping it stops the listener, discovery and all transfers.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        config: AppConfig,
        identity: LocalIdentity,
        radio: Arc<dyn Radio>,
        app_events: mpsc::Sender<AppEvent>,
    ) -> Self {
        let lifetime = CancellationToken::new();
        let (transfer_tx, transfer_rx) = mpsc::channel(TRANSFER_EVENT_CAPACITY);
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();

        let discovery = Discovery::new(
            radio,
            config.service_id,
            config.peer_stale_after(),
            config.prune_interval(),
            discovery_tx,
        );
        let active = ActiveTransfers::new(lifetime.child_token());
        let queue = SendQueue::new(transfer_tx.clone(), active.clone(), config.connect_timeout());

        let inner = Arc::new(SessionInner {
            pending: Arc::new(PendingRequests::new(config.max_pending_requests)),
            history: TransferHistory::new(config.history_limit),
            trusted: Arc::new(TrustedEndpoints::new()),
            pairing: PairingManager::new(),
            listener: Mutex::new(None),
            config,
            identity,
            discovery,
            active,
            queue,
            transfer_tx,
            app_events,
            lifetime: lifetime.clone(),
        });

        tokio::spawn(pump(inner.clone(), transfer_rx, discovery_rx, lifetime));
        Self { inner }
    }

    /// Bind the listener and start discovery. Returns the bound address.
    ///
    /// A dead radio does not fail the start; it is reported as
    /// `RadioUnavailable` and can be retried with [`Session::restart_discovery`].
    pub async fn start(&self) -> Result<SocketAddr> {
        let inner = &self.inner;
        if let Some(addr) = self.listen_addr() {
            return Ok(addr);
        }

        let download_dir = inner.config.download_path.clone();
        tokio::fs::create_dir_all(&download_dir).await?;
        clear_staging(&download_dir).await;

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, inner.config.listen_port));
        let server = TransferServer::bind(bind_addr).await?;
        let local_addr = server.local_addr();
        let advertised = server.advertised_endpoint();

        let ctx = ReceiverContext {
            download_dir,
            events: inner.transfer_tx.clone(),
            pending: inner.pending.clone(),
            trust: inner.trusted.clone(),
            active: inner.active.clone(),
        };
        let token = inner.lifetime.child_token();
        tokio::spawn(server.run(ctx, token.clone()));

        *inner.listener.lock() = Some(Listener {
            token,
            local_addr,
            advertised,
        });

        inner
            .emit(AppEvent::ListenerReady {
                addr: local_addr,
                advertised: advertised.socket_addr(),
            })
            .await;

        if let Err(e) = self.restart_discovery().await {
            tracing::warn!("Discovery unavailable: {}", e);
        }
        Ok(local_addr)
    }

    /// Stop everything started by [`Session::start`] and forget peers and
    /// pairing trust. History survives.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.discovery.stop_scanning();
        inner.discovery.stop_advertising();
        self.cancel_transfers().await;
        inner.pairing.reset();

        if let Some(listener) = inner.listener.lock().take() {
            listener.token.cancel();
        }

        inner.discovery.registry().clear();
        inner.trusted.clear();
        inner.emit(inner.publish_peers()).await;
        inner.emit(AppEvent::Status("Stopped".to_string())).await;
    }

    /// (Re)issue the advertise and scan calls, e.g. after the radio came back.
    pub async fn restart_discovery(&self) -> Result<()> {
        let inner = &self.inner;
        let advertised = inner
            .listener
            .lock()
            .as_ref()
            .map(|l| l.advertised)
            .ok_or(BeamError::NotRunning)?;

        let started = inner
            .discovery
            .start_advertising(&inner.identity.device_name, advertised)
            .and_then(|_| inner.discovery.start_scanning());

        if let Err(e) = &started {
            inner.emit(AppEvent::RadioUnavailable(e.to_string())).await;
        }
        started
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().as_ref().map(|l| l.local_addr)
    }

    /// Queue files for a known peer. Returns the transfer ids in queue order.
    pub fn send_files(&self, peer_id: &str, paths: Vec<PathBuf>) -> Result<Vec<String>> {
        let peer = self
            .inner
            .discovery
            .registry()
            .get(peer_id)
            .ok_or_else(|| BeamError::UnknownPeer(peer_id.to_string()))?;
        let target = peer
            .endpoint
            .ok_or_else(|| BeamError::NoEndpoint(peer.label()))?;
        Ok(self.send_files_to(target, paths))
    }

    pub fn send_files_to(&self, target: SocketAddr, paths: Vec<PathBuf>) -> Vec<String> {
        let files: Vec<QueuedFile> = paths.into_iter().map(QueuedFile::new).collect();
        let ids = files.iter().map(|f| f.transfer_id.clone()).collect();
        tracing::info!("Queueing {} file(s) for {}", files.len(), target);
        self.inner.queue.enqueue(target, files);
        ids
    }

    pub async fn accept_request(&self, request_id: &str) -> Result<TransferRequest> {
        self.inner.pending.respond(request_id, Decision::Accept).await
    }

    pub async fn decline_request(&self, request_id: &str) -> Result<TransferRequest> {
        self.inner.pending.respond(request_id, Decision::Decline).await
    }

    pub async fn pending_requests(&self) -> Vec<TransferRequest> {
        self.inner.pending.list().await
    }

    /// Ask `peer_id` to show a code; the user then types it into this device.
    pub async fn initiate_pairing(&self, peer_id: &str) -> Result<()> {
        let inner = &self.inner;
        let peer = inner
            .discovery
            .registry()
            .get(peer_id)
            .ok_or_else(|| BeamError::UnknownPeer(peer_id.to_string()))?;
        let target = peer
            .endpoint
            .ok_or_else(|| BeamError::NoEndpoint(peer.label()))?;
        let reply_port = self.listen_addr().ok_or(BeamError::NotRunning)?.port();

        inner.pairing.initiate(target);
        if let Err(e) =
            sender::request_pairing(target, reply_port, inner.config.connect_timeout()).await
        {
            inner.pairing.reset();
            return Err(e);
        }

        inner
            .emit(AppEvent::RequestPairingCode { peer: target })
            .await;
        Ok(())
    }

    /// Send the code read off the other device. Ok(false) on a mismatch.
    pub async fn submit_pairing_code(&self, code: &str) -> Result<bool> {
        let inner = &self.inner;
        let reply_port = self.listen_addr().ok_or(BeamError::NotRunning)?.port();
        let target = inner.pairing.begin_verifying()?;

        let accepted = match sender::submit_pairing_code(
            target,
            code,
            reply_port,
            inner.config.connect_timeout(),
        )
        .await
        {
            Ok(accepted) => accepted,
            Err(e) => {
                inner.pairing.reset();
                return Err(e);
            }
        };

        let outcome = inner.pairing.finish_verifying(accepted);
        if accepted {
            inner.trust_endpoint(target);
        }
        inner
            .emit(AppEvent::PairingResult {
                success: accepted,
                peer: target,
                message: match outcome {
                    Ok(_) => "Paired".to_string(),
                    Err(e) => e.to_string(),
                },
            })
            .await;
        Ok(accepted)
    }

    pub fn cancel_pairing(&self) {
        self.inner.pairing.reset();
    }

    pub fn pairing(&self) -> &PairingManager {
        &self.inner.pairing
    }

    pub fn pairing_state(&self) -> PairingState {
        self.inner.pairing.state()
    }

    /// Abort every running transfer and drop everything still queued.
    pub async fn cancel_transfers(&self) {
        let inner = &self.inner;
        let dropped = inner.queue.clear();
        let running = inner.active.cancel_all();
        if running > 0 || !dropped.is_empty() {
            tracing::info!(
                "Cancelled {} running and {} queued transfer(s)",
                running,
                dropped.len()
            );
        }
    }

    pub fn add_manual_peer(&self, ip: IpAddr, port: u16, name: &str) -> Peer {
        self.inner.discovery.add_manual_peer(ip, port, name)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.discovery.peers()
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.inner.trusted.is_trusted(ip)
    }

    pub fn history(&self) -> Vec<TransferHistoryItem> {
        self.inner.history.snapshot()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.lifetime.cancel();
    }
}

impl SessionInner {
    async fn emit(&self, event: AppEvent) {
        let _ = self.app_events.send(event).await;
    }

    fn publish_peers(&self) -> AppEvent {
        AppEvent::PeersChanged(self.discovery.peers())
    }

    /// Remember `endpoint` as paired and make sure it shows up in the peer list.
    fn trust_endpoint(&self, endpoint: SocketAddr) {
        let ip = endpoint.ip();
        self.trusted.trust(ip);
        if self.discovery.registry().mark_trusted(ip).is_empty() {
            self.discovery
                .add_manual_peer(ip, endpoint.port(), PAIRED_PEER_NAME);
            self.discovery.registry().mark_trusted(ip);
        }
        tracing::info!("Trusting {}", ip);
    }

    async fn on_transfer_event(&self, event: TransferEvent) {
        let app_event = match event {
            TransferEvent::Requested {
                request,
                auto_accepted: true,
            } => AppEvent::Status(format!(
                "Auto-accepted {} from {}",
                request.file_name, request.peer
            )),
            TransferEvent::Requested { request, .. } => AppEvent::TransferRequest(request),
            TransferEvent::RequestWithdrawn { request_id } => {
                AppEvent::TransferRequestWithdrawn { request_id }
            }
            TransferEvent::Started {
                id,
                file_name,
                declared_size,
                direction,
                peer,
            } => {
                self.history
                    .record(&id, &file_name, declared_size, direction);
                AppEvent::TransferStarted {
                    id,
                    file_name,
                    declared_size,
                    direction,
                    peer,
                }
            }
            TransferEvent::Progress {
                id,
                direction,
                transferred,
                percent,
            } => {
                self.history.update_progress(&id, percent);
                AppEvent::TransferProgress {
                    id,
                    direction,
                    transferred,
                    percent,
                }
            }
            TransferEvent::SpeedSample {
                id,
                direction,
                sample,
            } => AppEvent::TransferSpeed {
                id,
                direction,
                bytes_per_sec: sample.bytes_per_sec,
                speed: format_speed(sample.bytes_per_sec),
                eta: format_eta(sample.eta),
            },
            TransferEvent::Completed {
                id,
                direction,
                file_name,
                saved_path,
                truncated,
                ..
            } => {
                self.history.set_state(&id, TransferState::Completed);
                AppEvent::TransferCompleted {
                    id,
                    direction,
                    file_name,
                    saved_path,
                    truncated,
                }
            }
            TransferEvent::Failed {
                id,
                direction,
                file_name,
                error,
            } => {
                self.history.set_state(&id, TransferState::Failed);
                AppEvent::TransferFailed {
                    id,
                    direction,
                    file_name,
                    error,
                }
            }
            TransferEvent::Declined {
                id,
                direction,
                file_name,
                declared_size,
            } => {
                // Inbound offers declined before starting have no entry yet
                self.history
                    .record(&id, &file_name, declared_size, direction);
                self.history.set_state(&id, TransferState::Cancelled);
                AppEvent::TransferDeclined {
                    id,
                    direction,
                    file_name,
                }
            }
            TransferEvent::Cancelled {
                id,
                direction,
                file_name,
            } => {
                self.history.set_state(&id, TransferState::Cancelled);
                AppEvent::TransferCancelled {
                    id,
                    direction,
                    file_name,
                }
            }
            TransferEvent::PairingRequested { from } => {
                let code = self.pairing.generate_code(from);
                AppEvent::ShowPairingCode { code, from }
            }
            TransferEvent::PairingCodeSubmitted {
                from,
                code,
                verdict,
            } => {
                match self.pairing.verify_local_code(from, &code) {
                    Ok(peer) => {
                        self.trust_endpoint(peer);
                        let _ = verdict.send(true);
                        AppEvent::PairingResult {
                            success: true,
                            peer,
                            message: "Paired".to_string(),
                        }
                    }
                    // Not part of the attempt on screen; it stays open
                    Err(e @ BeamError::ForeignPairingSource(_)) => {
                        let _ = verdict.send(false);
                        AppEvent::Status(e.to_string())
                    }
                    Err(e) => {
                        let _ = verdict.send(false);
                        AppEvent::PairingResult {
                            success: false,
                            peer: from,
                            message: e.to_string(),
                        }
                    }
                }
            }
        };
        self.emit(app_event).await;
    }

    async fn on_discovery_event(&self, event: DiscoveryEvent) {
        match &event {
            DiscoveryEvent::PeerFound(peer) | DiscoveryEvent::PeerUpdated(peer) => {
                // Trust follows the endpoint, not the radio identity
                if let Some(ip) = peer.ip() {
                    if !peer.trusted && self.trusted.is_trusted(ip) {
                        self.discovery.registry().mark_trusted(ip);
                    }
                }
            }
            DiscoveryEvent::PeerLost(_) => {}
        }
        self.emit(self.publish_peers()).await;
    }
}

async fn pump(
    inner: Arc<SessionInner>,
    mut transfers: mpsc::Receiver<TransferEvent>,
    mut discovery: mpsc::UnboundedReceiver<DiscoveryEvent>,
    lifetime: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = lifetime.cancelled() => break,
            Some(event) = transfers.recv() => inner.on_transfer_event(event).await,
            Some(event) = discovery.recv() => inner.on_discovery_event(event).await,
            else => break,
        }
    }
    tracing::debug!("Session event pump stopped");
}
