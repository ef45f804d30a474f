//! Per-connection receive state machine: header, approval, body.

use super::constants::{CHUNK_SIZE, STAGING_DIR};
use super::pending::Decision;
use super::progress::{ThroughputMeter, percent};
use super::protocol::{ControlLine, HeaderScan, Reply, scan_header};
use super::utils::{open_secure_file, reserve_unique_destination, sanitize_file_name, staging_path};
use super::{Direction, ReceiverContext, TransferEvent, TransferRequest};
use crate::{BeamError, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    ReadingHeader,
    AwaitingApproval,
    ReadingBody,
    Finished,
}

/// How the approval and body phases ended.
enum Outcome {
    Completed { received: u64, truncated: bool },
    Declined,
    /// Sender hung up while the user was still deciding
    Withdrawn,
    Cancelled,
}

/// Services exactly one inbound connection, then stops for good.
pub struct FileReceiver<S> {
    stream: S,
    peer: SocketAddr,
    ctx: ReceiverContext,
    state: ReceiverState,
    buf: BytesMut,
    /// Promotion and temp-file cleanup each act on the same file, so only
    /// the first of them may run.
    completed: bool,
}

impl<S> FileReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: SocketAddr, ctx: ReceiverContext) -> Self {
        Self {
            stream,
            peer,
            ctx,
            state: ReceiverState::ReadingHeader,
            buf: BytesMut::with_capacity(CHUNK_SIZE),
            completed: false,
        }
    }

    /// Drive the connection to its end. Errors are already reported as events.
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;

        if let Err(e) = &result {
            if !e.is_cancelled() {
                tracing::warn!("Connection from {} ended while {:?}: {}", self.peer, self.state, e);
            }
        }
        self.state = ReceiverState::Finished;
        let _ = self.stream.shutdown().await;
        result
    }

    async fn serve(&mut self) -> Result<()> {
        match self.read_header().await? {
            ControlLine::PairRequest { reply_port } => {
                self.handle_pair_request(reply_port).await;
                Ok(())
            }
            ControlLine::PairVerify { code, reply_port } => {
                self.handle_pair_verify(code, reply_port).await
            }
            ControlLine::FileHeader {
                file_name,
                file_size,
            } => self.handle_file(file_name, file_size).await,
        }
    }

    async fn emit(&self, event: TransferEvent) {
        let _ = self.ctx.events.send(event).await;
    }

    /// True for the first caller only.
    fn claim_completion(&mut self) -> bool {
        !std::mem::replace(&mut self.completed, true)
    }

    async fn read_header(&mut self) -> Result<ControlLine> {
        let mut at_eof = false;
        loop {
            match scan_header(&self.buf, at_eof)? {
                HeaderScan::Complete { line, header_len } => {
                    // Whatever follows the header is body
                    let _ = self.buf.split_to(header_len);
                    tracing::debug!("Header from {}: {:?}", self.peer, line);
                    return Ok(line);
                }
                HeaderScan::Incomplete => {
                    self.buf.reserve(CHUNK_SIZE);
                    if self.stream.read_buf(&mut self.buf).await? == 0 {
                        at_eof = true;
                    }
                }
            }
        }
    }

    async fn reply(&mut self, reply: Reply) -> Result<()> {
        self.stream.write_all(reply.encode()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn handle_pair_request(&mut self, reply_port: u16) {
        let from = SocketAddr::new(self.peer.ip(), reply_port);
        tracing::info!("Pairing request from {}", from);
        self.emit(TransferEvent::PairingRequested { from }).await;
    }

    async fn handle_pair_verify(&mut self, code: String, reply_port: Option<u16>) -> Result<()> {
        let from = SocketAddr::new(self.peer.ip(), reply_port.unwrap_or(self.peer.port()));
        let (verdict_tx, verdict_rx) = oneshot::channel();
        self.emit(TransferEvent::PairingCodeSubmitted {
            from,
            code,
            verdict: verdict_tx,
        })
        .await;

        let accepted = verdict_rx.await.unwrap_or(false);
        let reply = if accepted { Reply::PairAck } else { Reply::PairFail };
        self.reply(reply).await
    }

    async fn handle_file(&mut self, raw_name: String, declared_size: u64) -> Result<()> {
        let request = TransferRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            file_name: sanitize_file_name(&raw_name),
            declared_size,
            peer: self.peer,
        };
        tracing::info!(
            "Incoming {} ({} bytes) from {}",
            request.file_name,
            declared_size,
            self.peer
        );

        let guard = self.ctx.active.register(&request.request_id);
        let token = guard.token().clone();
        let temp_path = staging_path(&self.ctx.download_dir, &request.request_id);

        let outcome = self.receive_into(&request, &temp_path, &token).await;

        if self.ctx.pending.withdraw(&request.request_id).await.is_some() {
            self.emit(TransferEvent::RequestWithdrawn {
                request_id: request.request_id.clone(),
            })
            .await;
        }

        let id = request.request_id.clone();
        let file_name = request.file_name.clone();
        match outcome {
            Ok(Outcome::Completed {
                received,
                truncated,
            }) => self.complete(&request, &temp_path, received, truncated).await,
            Ok(Outcome::Declined) => {
                discard(&temp_path).await;
                tracing::info!("Declined {} from {}", file_name, self.peer);
                self.emit(TransferEvent::Declined {
                    id,
                    direction: Direction::Incoming,
                    file_name,
                    declared_size: request.declared_size,
                })
                .await;
                Ok(())
            }
            Ok(Outcome::Withdrawn) => {
                discard(&temp_path).await;
                tracing::info!("{} withdrew {}", self.peer, file_name);
                Ok(())
            }
            Ok(Outcome::Cancelled) => {
                discard(&temp_path).await;
                tracing::info!("Cancelled receiving {}", file_name);
                self.emit(TransferEvent::Cancelled {
                    id,
                    direction: Direction::Incoming,
                    file_name,
                })
                .await;
                Err(BeamError::Cancelled)
            }
            Err(e) => {
                self.fail(&request, &temp_path, &e).await;
                Err(e)
            }
        }
    }

    async fn receive_into(
        &mut self,
        request: &TransferRequest,
        temp_path: &Path,
        token: &CancellationToken,
    ) -> Result<Outcome> {
        let declared = request.declared_size;
        let trusted = self.ctx.trust.is_trusted(self.peer.ip());

        if trusted {
            // Paired peers skip the prompt entirely
            self.reply(Reply::Accept).await?;
            tracing::info!("Auto-accepted {} from trusted {}", request.file_name, self.peer);
        }

        if let Some(staging) = temp_path.parent() {
            tokio::fs::create_dir_all(staging).await?;
        }
        let mut file = open_secure_file(temp_path).await?;
        let mut received = 0u64;
        write_capped(&mut file, &mut self.buf, &mut received, declared).await?;

        if trusted {
            self.emit(TransferEvent::Requested {
                request: request.clone(),
                auto_accepted: true,
            })
            .await;
        } else {
            let Some(mut decision_rx) = self.ctx.pending.try_add(request.clone()).await else {
                tracing::warn!(
                    "Too many pending requests, declining {} from {}",
                    request.file_name,
                    self.peer
                );
                self.reply(Reply::Decline).await?;
                return Ok(Outcome::Declined);
            };

            self.state = ReceiverState::AwaitingApproval;
            self.emit(TransferEvent::Requested {
                request: request.clone(),
                auto_accepted: false,
            })
            .await;

            // Keep draining the socket into the temp file while the user decides
            let decision = loop {
                self.buf.reserve(CHUNK_SIZE);
                tokio::select! {
                    _ = token.cancelled() => return Ok(Outcome::Cancelled),
                    decision = &mut decision_rx => break decision.unwrap_or(Decision::Decline),
                    read = self.stream.read_buf(&mut self.buf) => {
                        if read? == 0 {
                            return Ok(Outcome::Withdrawn);
                        }
                        write_capped(&mut file, &mut self.buf, &mut received, declared).await?;
                    }
                }
            };

            if decision == Decision::Decline {
                self.reply(Reply::Decline).await?;
                return Ok(Outcome::Declined);
            }
            self.reply(Reply::Accept).await?;
        }

        self.state = ReceiverState::ReadingBody;
        self.emit(TransferEvent::Started {
            id: request.request_id.clone(),
            file_name: request.file_name.clone(),
            declared_size: declared,
            direction: Direction::Incoming,
            peer: self.peer,
        })
        .await;

        let mut meter = ThroughputMeter::new(declared, Instant::now());
        let mut reported = None;
        let mut truncated = false;

        while received < declared {
            self.buf.reserve(CHUNK_SIZE);
            let read = tokio::select! {
                _ = token.cancelled() => return Ok(Outcome::Cancelled),
                read = self.stream.read_buf(&mut self.buf) => read?,
            };
            if read == 0 {
                truncated = true;
                break;
            }
            write_capped(&mut file, &mut self.buf, &mut received, declared).await?;

            if let Some(sample) = meter.record(received, Instant::now()) {
                self.report(request, received, Some(sample)).await;
                reported = Some(received);
            }
        }

        if reported != Some(received) {
            self.report(request, received, None).await;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(Outcome::Completed {
            received,
            truncated,
        })
    }

    async fn report(
        &self,
        request: &TransferRequest,
        received: u64,
        sample: Option<super::SpeedSample>,
    ) {
        self.emit(TransferEvent::Progress {
            id: request.request_id.clone(),
            direction: Direction::Incoming,
            transferred: received,
            percent: percent(received, request.declared_size),
        })
        .await;
        if let Some(sample) = sample {
            self.emit(TransferEvent::SpeedSample {
                id: request.request_id.clone(),
                direction: Direction::Incoming,
                sample,
            })
            .await;
        }
    }

    async fn complete(
        &mut self,
        request: &TransferRequest,
        temp_path: &Path,
        received: u64,
        truncated: bool,
    ) -> Result<()> {
        if !self.claim_completion() {
            tracing::debug!("Completion for {} already handled", request.request_id);
            return Ok(());
        }

        let saved_path = match promote(temp_path, &self.ctx.download_dir, &request.file_name).await {
            Ok(path) => path,
            Err(e) => {
                discard(temp_path).await;
                let e = BeamError::from(e);
                self.report_failure(request, &e).await;
                return Err(e);
            }
        };

        if truncated {
            tracing::warn!(
                "{} closed early: kept {} of {} declared bytes as {:?}",
                self.peer,
                received,
                request.declared_size,
                saved_path
            );
        } else {
            tracing::info!("Received {} -> {:?}", request.file_name, saved_path);
        }

        self.emit(TransferEvent::Completed {
            id: request.request_id.clone(),
            direction: Direction::Incoming,
            file_name: request.file_name.clone(),
            saved_path: Some(saved_path),
            transferred: received,
            declared_size: request.declared_size,
            truncated,
        })
        .await;
        Ok(())
    }

    async fn fail(&mut self, request: &TransferRequest, temp_path: &Path, error: &BeamError) {
        if !self.claim_completion() {
            return;
        }
        discard(temp_path).await;
        self.report_failure(request, error).await;
    }

    async fn report_failure(&self, request: &TransferRequest, error: &BeamError) {
        tracing::error!("Receiving {} failed: {}", request.file_name, error);
        self.emit(TransferEvent::Failed {
            id: request.request_id.clone(),
            direction: Direction::Incoming,
            file_name: request.file_name.clone(),
            error: error.to_string(),
        })
        .await;
    }
}

/// Append buffered bytes to `file`, never past `declared`. Extra bytes are dropped.
async fn write_capped(
    file: &mut File,
    buf: &mut BytesMut,
    received: &mut u64,
    declared: u64,
) -> std::io::Result<()> {
    let room = declared.saturating_sub(*received);
    let take = (buf.len() as u64).min(room) as usize;
    if take > 0 {
        file.write_all(&buf[..take]).await?;
        *received += take as u64;
    }
    buf.clear();
    Ok(())
}

/// Move a finished temp file to a free name in the download folder.
async fn promote(temp_path: &Path, download_dir: &Path, file_name: &str) -> std::io::Result<PathBuf> {
    let destination = reserve_unique_destination(download_dir, file_name).await?;
    if let Err(e) = tokio::fs::rename(temp_path, &destination).await {
        let _ = tokio::fs::remove_file(&destination).await;
        return Err(e);
    }
    Ok(destination)
}

async fn discard(temp_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Could not remove partial file {:?}: {}", temp_path, e);
        }
    }
}

/// Remove partial files left behind by an earlier run.
pub async fn clear_staging(download_dir: &Path) {
    let staging = download_dir.join(STAGING_DIR);
    if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Could not clear {:?}: {}", staging, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::TrustedEndpoints;
    use crate::transfer::{ActiveTransfers, PendingRequests};
    use std::sync::Arc;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    fn context(dir: &Path, trust: Arc<TrustedEndpoints>) -> (ReceiverContext, mpsc::Receiver<TransferEvent>) {
        let (events, rx) = mpsc::channel(64);
        let ctx = ReceiverContext {
            download_dir: dir.to_path_buf(),
            events,
            pending: Arc::new(PendingRequests::new(4)),
            trust,
            active: ActiveTransfers::new(CancellationToken::new()),
        };
        (ctx, rx)
    }

    fn peer() -> SocketAddr {
        "10.1.1.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_early_body_bytes_survive_approval() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut events) = context(dir.path(), Arc::new(TrustedEndpoints::new()));
        let pending = ctx.pending.clone();
        let (mut client, server) = duplex(1024);

        let receiver = tokio::spawn(FileReceiver::new(server, peer(), ctx).run());

        // Header and the first body bytes arrive before anyone decides
        client.write_all(b"early.txt::10::hello").await.unwrap();
        let request = match events.recv().await.unwrap() {
            TransferEvent::Requested {
                request,
                auto_accepted: false,
            } => request,
            other => panic!("unexpected {:?}", other),
        };
        pending.respond(&request.request_id, Decision::Accept).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ACCEPT::");

        client.write_all(b"world").await.unwrap();
        client.shutdown().await.unwrap();
        receiver.await.unwrap().unwrap();

        let saved = tokio::fs::read(dir.path().join("early.txt")).await.unwrap();
        assert_eq!(saved, b"helloworld");
    }

    #[tokio::test]
    async fn test_decline_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut events) = context(dir.path(), Arc::new(TrustedEndpoints::new()));
        let pending = ctx.pending.clone();
        let (mut client, server) = duplex(1024);
        let receiver = tokio::spawn(FileReceiver::new(server, peer(), ctx).run());

        client.write_all(b"no.txt::3::abc").await.unwrap();
        let Some(TransferEvent::Requested { request, .. }) = events.recv().await else {
            panic!("expected request");
        };
        pending.respond(&request.request_id, Decision::Decline).await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"DECLINE::");
        receiver.await.unwrap().unwrap();

        assert!(!dir.path().join("no.txt").exists());
        let staging = dir.path().join(STAGING_DIR);
        let mut entries = tokio::fs::read_dir(&staging).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_body_is_kept_and_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let trust = Arc::new(TrustedEndpoints::new());
        trust.trust(peer().ip());
        let (ctx, mut events) = context(dir.path(), trust);
        let (mut client, server) = duplex(1024);
        let receiver = tokio::spawn(FileReceiver::new(server, peer(), ctx).run());

        client.write_all(b"short.bin::100::1234").await.unwrap();
        client.shutdown().await.unwrap();
        receiver.await.unwrap().unwrap();

        let mut truncated_flag = None;
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::Completed {
                truncated,
                transferred,
                ..
            } = event
            {
                assert_eq!(transferred, 4);
                truncated_flag = Some(truncated);
            }
        }
        assert_eq!(truncated_flag, Some(true));
    }

    #[tokio::test]
    async fn test_withdrawn_request_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut events) = context(dir.path(), Arc::new(TrustedEndpoints::new()));
        let pending = ctx.pending.clone();
        let (mut client, server) = duplex(1024);
        let receiver = tokio::spawn(FileReceiver::new(server, peer(), ctx).run());

        client.write_all(b"gone.txt::5::").await.unwrap();
        assert!(matches!(events.recv().await, Some(TransferEvent::Requested { .. })));
        drop(client);

        receiver.await.unwrap().unwrap();
        assert!(matches!(
            events.recv().await,
            Some(TransferEvent::RequestWithdrawn { .. })
        ));
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_completion_guard_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _events) = context(dir.path(), Arc::new(TrustedEndpoints::new()));
        let (_client, server) = duplex(64);
        let mut receiver = FileReceiver::new(server, peer(), ctx);

        assert!(receiver.claim_completion());
        assert!(!receiver.claim_completion());
    }
}
