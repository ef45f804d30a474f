//! Headless node: listens, advertises, logs every event.
//!
//! Usage: beam_node [--accept-all] [--download-dir DIR] [--port PORT] [--save-config]

use anyhow::{Context, Result, bail};
use beam_core::config::{AppConfig, LocalIdentity};
use beam_core::discovery::{Radio, UdpRadio};
use beam_core::{AppCommand, AppEvent, run_backend_with};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

struct Args {
    accept_all: bool,
    download_dir: Option<PathBuf>,
    port: Option<u16>,
    /// Persist the effective settings for later runs
    save_config: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        accept_all: false,
        download_dir: None,
        port: None,
        save_config: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--accept-all" => args.accept_all = true,
            "--save-config" => args.save_config = true,
            "--download-dir" => {
                args.download_dir = Some(it.next().context("--download-dir needs a path")?.into())
            }
            "--port" => {
                let port = it.next().context("--port needs a number")?;
                args.port = Some(port.parse().context("invalid --port")?);
            }
            other => bail!("unknown argument {}", other),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let mut config = AppConfig::load();
    if let Some(dir) = args.download_dir {
        config.download_path = dir;
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if args.save_config {
        config.save().context("could not save config")?;
    }

    let identity = LocalIdentity::load(&config);
    let radio: Arc<dyn Radio> = Arc::new(UdpRadio::new(
        identity.device_id.clone(),
        config.discovery_port,
    ));

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let backend = tokio::spawn(run_backend_with(config, identity, radio, cmd_rx, event_tx));

    cmd_tx.send(AppCommand::Start).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    AppEvent::TransferRequest(request) if args.accept_all => {
                        tracing::info!("Accepting {} from {}", request.file_name, request.peer);
                        cmd_tx
                            .send(AppCommand::RespondTransferRequest {
                                request_id: request.request_id,
                                accepted: true,
                            })
                            .await?;
                    }
                    AppEvent::TransferRequest(request) => {
                        tracing::info!(
                            "Declining {} from {} (start with --accept-all to receive)",
                            request.file_name,
                            request.peer
                        );
                        cmd_tx
                            .send(AppCommand::RespondTransferRequest {
                                request_id: request.request_id,
                                accepted: false,
                            })
                            .await?;
                    }
                    AppEvent::ShowPairingCode { code, from } => {
                        tracing::info!("Pairing code for {}: {}", from, code);
                    }
                    AppEvent::Error(e) => tracing::error!("{}", e),
                    AppEvent::TransferProgress { .. } => {}
                    other => tracing::info!("{:?}", other),
                }
            }
        }
    }

    drop(cmd_tx);
    let _ = backend.await;
    Ok(())
}
