//! Active transfers, keyed by batch id
//!
//! Each running transfer owns a [`CancellationToken`] registered here; pausing
//! cancels it. The entry is removed when the [`ActiveTransfer`] guard drops,
//! whether the transfer completed, failed or was paused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{TransferError, TransferResult};

#[derive(Clone, Default)]
pub struct TransferRegistry {
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer. Fails if the batch is already running.
    pub fn register(&self, batch_id: &str) -> TransferResult<ActiveTransfer> {
        let mut active = self.lock();
        if active.contains_key(batch_id) {
            return Err(TransferError::AlreadyActive(batch_id.to_string()));
        }
        let token = CancellationToken::new();
        active.insert(batch_id.to_string(), token.clone());
        Ok(ActiveTransfer {
            batch_id: batch_id.to_string(),
            token,
            registry: self.clone(),
        })
    }

    /// Cancel a running transfer. Returns false if none was registered.
    pub fn cancel(&self, batch_id: &str) -> bool {
        match self.lock().get(batch_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything (process shutdown)
    pub fn cancel_all(&self) {
        for token in self.lock().values() {
            token.cancel();
        }
    }

    pub fn is_active(&self, batch_id: &str) -> bool {
        self.lock().contains_key(batch_id)
    }

    pub fn active(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        // the map stays consistent even if a holder panicked
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registration guard for one running transfer
pub struct ActiveTransfer {
    batch_id: String,
    token: CancellationToken,
    registry: TransferRegistry,
}

impl ActiveTransfer {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ActiveTransfer {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.batch_id);
    }
}
