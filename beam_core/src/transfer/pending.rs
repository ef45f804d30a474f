//! Inbound offers waiting for the user to accept or decline.

use super::TransferRequest;
use crate::{BeamError, Result};
use std::collections::HashMap;
use tokio::sync::{RwLock, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Decline,
}

struct PendingEntry {
    request: TransferRequest,
    response_tx: oneshot::Sender<Decision>,
}

/// Keyed by request id. Each entry belongs to one receiver in `AwaitingApproval`.
pub struct PendingRequests {
    pending: RwLock<HashMap<String, PendingEntry>>,
    limit: usize,
}

impl PendingRequests {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            limit,
        }
    }

    /// Park a request. Returns None when the table is full.
    pub async fn try_add(&self, request: TransferRequest) -> Option<oneshot::Receiver<Decision>> {
        let mut pending = self.pending.write().await;
        if pending.len() >= self.limit {
            return None;
        }
        let (response_tx, response_rx) = oneshot::channel();
        pending.insert(
            request.request_id.clone(),
            PendingEntry {
                request,
                response_tx,
            },
        );
        Some(response_rx)
    }

    /// Route a decision to the waiting receiver.
    pub async fn respond(&self, request_id: &str, decision: Decision) -> Result<TransferRequest> {
        let entry = self
            .pending
            .write()
            .await
            .remove(request_id)
            .ok_or_else(|| BeamError::UnknownRequest(request_id.to_string()))?;

        // Receiver gone means the connection already dropped
        entry
            .response_tx
            .send(decision)
            .map_err(|_| BeamError::UnknownRequest(request_id.to_string()))?;
        Ok(entry.request)
    }

    /// Drop a request whose connection went away. Returns it if it was still pending.
    pub async fn withdraw(&self, request_id: &str) -> Option<TransferRequest> {
        self.pending
            .write()
            .await
            .remove(request_id)
            .map(|entry| entry.request)
    }

    pub async fn list(&self) -> Vec<TransferRequest> {
        self.pending
            .read()
            .await
            .values()
            .map(|entry| entry.request.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
