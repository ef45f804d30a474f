//! Rolling log of transfers for the UI.

use crate::transfer::Direction;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferHistoryItem {
    pub id: String,
    pub file_name: String,
    pub declared_size: u64,
    pub direction: Direction,
    pub progress_percent: f32,
    pub state: TransferState,
    pub created_at: SystemTime,
}

/// Newest first, capped at `limit` entries.
pub struct TransferHistory {
    items: RwLock<VecDeque<TransferHistoryItem>>,
    limit: usize,
}

impl TransferHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            items: RwLock::new(VecDeque::new()),
            limit: limit.max(1),
        }
    }

    /// Start tracking a transfer. A known id is left as it is.
    pub fn record(&self, id: &str, file_name: &str, declared_size: u64, direction: Direction) {
        let mut items = self.items.write();
        if items.iter().any(|item| item.id == id) {
            return;
        }
        items.push_front(TransferHistoryItem {
            id: id.to_string(),
            file_name: file_name.to_string(),
            declared_size,
            direction,
            progress_percent: 0.0,
            state: TransferState::InProgress,
            created_at: SystemTime::now(),
        });
        items.truncate(self.limit);
    }

    pub fn update_progress(&self, id: &str, percent: f32) {
        if let Some(item) = self.items.write().iter_mut().find(|item| item.id == id) {
            if item.state == TransferState::InProgress {
                item.progress_percent = percent.clamp(0.0, 100.0);
            }
        }
    }

    /// Move to a final state. Returns false for unknown ids.
    pub fn set_state(&self, id: &str, state: TransferState) -> bool {
        let mut items = self.items.write();
        let Some(item) = items.iter_mut().find(|item| item.id == id) else {
            return false;
        };
        item.state = state;
        if state == TransferState::Completed {
            item.progress_percent = 100.0;
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<TransferHistoryItem> {
        self.items.read().iter().find(|item| item.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<TransferHistoryItem> {
        self.items.read().iter().cloned().collect()
    }
}
