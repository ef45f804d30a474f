#![allow(dead_code)]

use beam_core::config::{AppConfig, LocalIdentity};
use beam_core::discovery::{Advertisement, Observation, Radio};
use beam_core::{AppEvent, BeamError, Session};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("beam_core=debug")
        .with_test_writer()
        .try_init();
}

/// Radio that accepts every call and never reports anything.
pub struct SilentRadio;

impl Radio for SilentRadio {
    fn start_advertising(&self, _: Uuid, _: Advertisement) -> beam_core::Result<()> {
        Ok(())
    }
    fn stop_advertising(&self) {}
    fn start_scanning(&self, _: Uuid, _: mpsc::UnboundedSender<Observation>) -> beam_core::Result<()> {
        Ok(())
    }
    fn stop_scanning(&self) {}
}

/// Radio switched off.
pub struct DeadRadio;

impl Radio for DeadRadio {
    fn start_advertising(&self, _: Uuid, _: Advertisement) -> beam_core::Result<()> {
        Err(BeamError::RadioUnavailable("radio off".to_string()))
    }
    fn stop_advertising(&self) {}
    fn start_scanning(&self, _: Uuid, _: mpsc::UnboundedSender<Observation>) -> beam_core::Result<()> {
        Err(BeamError::RadioUnavailable("radio off".to_string()))
    }
    fn stop_scanning(&self) {}
}

/// Records what is advertised and lets the test inject sightings.
#[derive(Default)]
pub struct MockRadio {
    pub started: Mutex<Vec<Advertisement>>,
    pub stopped: Mutex<usize>,
    scanner: Mutex<Option<mpsc::UnboundedSender<Observation>>>,
}

impl MockRadio {
    pub fn inject(&self, observation: Observation) {
        let scanner = self.scanner.lock();
        let tx = scanner.as_ref().expect("not scanning");
        tx.send(observation).expect("scan task gone");
    }
}

impl Radio for MockRadio {
    fn start_advertising(&self, _: Uuid, advertisement: Advertisement) -> beam_core::Result<()> {
        self.started.lock().push(advertisement);
        Ok(())
    }
    fn stop_advertising(&self) {
        *self.stopped.lock() += 1;
    }
    fn start_scanning(
        &self,
        _: Uuid,
        observations: mpsc::UnboundedSender<Observation>,
    ) -> beam_core::Result<()> {
        *self.scanner.lock() = Some(observations);
        Ok(())
    }
    fn stop_scanning(&self) {
        self.scanner.lock().take();
    }
}

pub fn test_config(download_dir: &Path) -> AppConfig {
    AppConfig {
        device_name: "test-node".to_string(),
        download_path: download_dir.to_path_buf(),
        listen_port: 0,
        connect_timeout_secs: 2,
        ..AppConfig::default()
    }
}

/// A started session on an OS-assigned port, reachable at 127.0.0.1.
pub struct Node {
    pub session: Session,
    pub events: mpsc::Receiver<AppEvent>,
    pub addr: SocketAddr,
    pub dir: TempDir,
}

impl Node {
    pub async fn start() -> Node {
        Self::start_with(Arc::new(SilentRadio)).await
    }

    pub async fn start_with(radio: Arc<dyn Radio>) -> Node {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(&dir.path().join("downloads"));
        let identity = LocalIdentity {
            device_id: Uuid::new_v4().to_string(),
            device_name: "test-node".to_string(),
        };

        let (event_tx, events) = mpsc::channel(4096);
        let session = Session::new(config, identity, radio, event_tx);
        let bound = session.start().await.expect("session should start");

        Node {
            session,
            events,
            addr: SocketAddr::from(([127, 0, 0, 1], bound.port())),
            dir,
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    /// Create a file under this node's scratch space.
    pub async fn write_source(&self, rel: &str, data: &[u8]) -> PathBuf {
        let path = self.dir.path().join("outbox").join(rel);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, data).await.unwrap();
        path
    }

    /// Skip events until `pick` returns Some.
    pub async fn wait_for<T>(&mut self, mut pick: impl FnMut(AppEvent) -> Option<T>) -> T {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if let Some(found) = pick(event) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Events already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<AppEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Deterministic non-trivial bytes, with plenty of `::` sequences.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| match i % 97 {
            10 | 11 => b':',
            n => (i.wrapping_mul(31) as u8) ^ (n as u8),
        })
        .collect()
}
