//! Per-target FIFO of outgoing files.
//!
//! Each target gets one lane and at most one drain task, so a peer never has
//! more than one outbound connection from us. Different targets drain in
//! parallel. A file's outcome never stops the files behind it.

use super::active::ActiveTransfers;
use super::sender::{OutgoingFile, connect, send_file};
use super::{Direction, TransferEvent};
use crate::{BeamError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFile {
    pub transfer_id: String,
    pub path: PathBuf,
    pub file_name: String,
}

impl QueuedFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            transfer_id: uuid::Uuid::new_v4().to_string(),
            file_name: super::utils::outgoing_file_name(&path),
            path,
        }
    }
}

#[derive(Default)]
struct Lane {
    files: VecDeque<QueuedFile>,
}

struct QueueInner {
    lanes: Mutex<HashMap<SocketAddr, Lane>>,
    events: mpsc::Sender<TransferEvent>,
    active: Arc<ActiveTransfers>,
    connect_timeout: Duration,
}

#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<QueueInner>,
}

impl SendQueue {
    pub fn new(
        events: mpsc::Sender<TransferEvent>,
        active: Arc<ActiveTransfers>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                lanes: Mutex::new(HashMap::new()),
                events,
                active,
                connect_timeout,
            }),
        }
    }

    /// Append files for `target`; starts draining if that lane is idle.
    pub fn enqueue(&self, target: SocketAddr, files: Vec<QueuedFile>) {
        if files.is_empty() {
            return;
        }

        let mut lanes = self.inner.lanes.lock();
        // A lane exists exactly while its drain task runs
        let start = !lanes.contains_key(&target);
        lanes.entry(target).or_default().files.extend(files);
        drop(lanes);

        if start {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.drain(target).await });
        }
    }

    /// Drop every file not yet started. Returns what was dropped.
    pub fn clear(&self) -> Vec<QueuedFile> {
        let mut lanes = self.inner.lanes.lock();
        lanes
            .values_mut()
            .flat_map(|lane| lane.files.drain(..))
            .collect()
    }

    /// Files still waiting (not counting the one being sent).
    pub fn queued(&self, target: SocketAddr) -> usize {
        self.inner
            .lanes
            .lock()
            .get(&target)
            .map_or(0, |lane| lane.files.len())
    }

    pub fn is_busy(&self, target: SocketAddr) -> bool {
        self.inner.lanes.lock().contains_key(&target)
    }
}

impl QueueInner {
    async fn drain(self: Arc<Self>, target: SocketAddr) {
        loop {
            let next = {
                let mut lanes = self.lanes.lock();
                match lanes.get_mut(&target).and_then(|lane| lane.files.pop_front()) {
                    Some(file) => file,
                    None => {
                        lanes.remove(&target);
                        return;
                    }
                }
            };

            let declared_size = tokio::fs::metadata(&next.path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            let result = self.send_one(target, &next, declared_size).await;
            self.report(&next, declared_size, result).await;
        }
    }

    async fn send_one(
        &self,
        target: SocketAddr,
        file: &QueuedFile,
        declared_size: u64,
    ) -> Result<u64> {
        let guard = self.active.register(&file.transfer_id);

        let _ = self
            .events
            .send(TransferEvent::Started {
                id: file.transfer_id.clone(),
                file_name: file.file_name.clone(),
                declared_size,
                direction: Direction::Outgoing,
                peer: target,
            })
            .await;

        let mut stream = tokio::select! {
            _ = guard.token().cancelled() => return Err(BeamError::Cancelled),
            stream = connect(target, self.connect_timeout) => stream?,
        };

        let outgoing = OutgoingFile {
            transfer_id: &file.transfer_id,
            path: &file.path,
            file_name: &file.file_name,
        };
        send_file(&mut stream, outgoing, &self.events, guard.token()).await
    }

    async fn report(&self, file: &QueuedFile, declared_size: u64, result: Result<u64>) {
        let id = file.transfer_id.clone();
        let file_name = file.file_name.clone();
        let direction = Direction::Outgoing;

        let event = match result {
            Ok(sent) => {
                tracing::info!("Sent {} ({} bytes)", file_name, sent);
                TransferEvent::Completed {
                    id,
                    direction,
                    file_name,
                    saved_path: None,
                    transferred: sent,
                    declared_size,
                    truncated: sent < declared_size,
                }
            }
            Err(e) if e.is_declined() => {
                tracing::info!("{} was declined", file_name);
                TransferEvent::Declined {
                    id,
                    direction,
                    file_name,
                    declared_size,
                }
            }
            Err(e) if e.is_cancelled() => TransferEvent::Cancelled {
                id,
                direction,
                file_name,
            },
            Err(e) => {
                tracing::error!("Sending {} failed: {}", file_name, e);
                TransferEvent::Failed {
                    id,
                    direction,
                    file_name,
                    error: e.to_string(),
                }
            }
        };
        let _ = self.events.send(event).await;
    }
}
