//! Cancellation handles for transfers that are currently moving bytes.
//!
//! Cancelling a transfer's token makes its loop drop the connection, which
//! the other side observes as a closed stream.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct ActiveTransfers {
    root: CancellationToken,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl ActiveTransfers {
    /// Tokens handed out are children of `root`, so cancelling it stops everything.
    pub fn new(root: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            root,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(self: &Arc<Self>, id: &str) -> ActiveGuard {
        let token = self.root.child_token();
        self.tokens.lock().insert(id.to_string(), token.clone());
        ActiveGuard {
            id: id.to_string(),
            token,
            registry: Arc::clone(self),
        }
    }

    pub fn cancel(&self, id: &str) -> bool {
        match self.tokens.lock().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered transfer; new ones may still start afterwards.
    pub fn cancel_all(&self) -> usize {
        let tokens = self.tokens.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unregisters its transfer when dropped.
pub struct ActiveGuard {
    id: String,
    token: CancellationToken,
    registry: Arc<ActiveTransfers>,
}

impl ActiveGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.registry.tokens.lock().remove(&self.id);
    }
}
