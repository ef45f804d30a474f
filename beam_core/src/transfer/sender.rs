use super::constants::{CHUNK_SIZE, CLOSE_GRACE};
use super::progress::{ThroughputMeter, percent};
use super::protocol::{ControlLine, Reply, read_reply};
use super::{Direction, TransferEvent};
use crate::{BeamError, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Dial `target`, giving up after `timeout`.
pub async fn connect(target: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(BeamError::Io(e)),
        Err(_) => Err(BeamError::Unreachable(target)),
    }
}

/// One outgoing file as it goes over the wire.
pub struct OutgoingFile<'a> {
    pub transfer_id: &'a str,
    pub path: &'a Path,
    pub file_name: &'a str,
}

/// Offer a file, wait for the verdict and stream the body.
///
/// Returns the number of body bytes sent. Ends with a half-close so the
/// receiver sees a clean EOF, then waits briefly for it to hang up.
pub async fn send_file<S>(
    stream: &mut S,
    file: OutgoingFile<'_>,
    events: &mpsc::Sender<TransferEvent>,
    cancel: &CancellationToken,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut source = File::open(file.path).await?;
    let size = source.metadata().await?.len();

    let header = ControlLine::FileHeader {
        file_name: file.file_name.to_string(),
        file_size: size,
    };
    stream.write_all(&header.encode()).await?;
    stream.flush().await?;

    let reply = tokio::select! {
        _ = cancel.cancelled() => return Err(BeamError::Cancelled),
        reply = read_reply(stream) => reply?,
    };
    match reply {
        Reply::Accept => {}
        Reply::Decline => return Err(BeamError::Declined),
        other => {
            return Err(BeamError::protocol(format!(
                "unexpected {:?} to a file offer",
                other
            )));
        }
    }
    tracing::info!("{} accepted, sending {} bytes", file.file_name, size);

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    let mut meter = ThroughputMeter::new(size, Instant::now());

    while sent < size {
        let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
        let n = source.read(&mut buffer[..want]).await?;
        if n == 0 {
            // File shrank under us; the receiver treats our close as EOF
            tracing::warn!("{} ended at {} of {} bytes", file.file_name, sent, size);
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(BeamError::Cancelled),
            written = stream.write_all(&buffer[..n]) => written?,
        }
        sent += n as u64;

        if let Some(sample) = meter.record(sent, Instant::now()) {
            let _ = events
                .send(TransferEvent::Progress {
                    id: file.transfer_id.to_string(),
                    direction: Direction::Outgoing,
                    transferred: sent,
                    percent: percent(sent, size),
                })
                .await;
            let _ = events
                .send(TransferEvent::SpeedSample {
                    id: file.transfer_id.to_string(),
                    direction: Direction::Outgoing,
                    sample,
                })
                .await;
        }
    }

    stream.flush().await?;
    stream.shutdown().await?;

    // Receiver closes once it has everything
    let mut sink = [0u8; 64];
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    })
    .await;

    Ok(sent)
}

/// Ask `target` to mint and display a pairing code. `reply_port` is our listener.
pub async fn request_pairing(target: SocketAddr, reply_port: u16, timeout: Duration) -> Result<()> {
    let mut stream = connect(target, timeout).await?;
    let line = ControlLine::PairRequest { reply_port };
    stream.write_all(&line.encode()).await?;
    stream.shutdown().await?;
    tracing::info!("Pairing request sent to {}", target);
    Ok(())
}

/// Submit the code the user typed. Ok(true) on `PAIR_ACK::`.
pub async fn submit_pairing_code(
    target: SocketAddr,
    code: &str,
    reply_port: u16,
    timeout: Duration,
) -> Result<bool> {
    let mut stream = connect(target, timeout).await?;
    let line = ControlLine::PairVerify {
        code: code.to_string(),
        reply_port: Some(reply_port),
    };
    stream.write_all(&line.encode()).await?;
    stream.shutdown().await?;

    match read_reply(&mut stream).await? {
        Reply::PairAck => Ok(true),
        Reply::PairFail => Ok(false),
        other => Err(BeamError::protocol(format!(
            "unexpected {:?} to a pairing code",
            other
        ))),
    }
}
