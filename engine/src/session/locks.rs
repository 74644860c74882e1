//! Per-session mutual exclusion
//!
//! One async mutex per [`SessionKey`]. Waiters on a tokio mutex are queued
//! in FIFO order, so events for one session run in arrival order while
//! different sessions never contend.

use sdk::types::SessionKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock table size above which idle entries are pruned
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionKey, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a session
    ///
    /// The guard releases the session when dropped, including when the
    /// holding future is cancelled.
    pub async fn acquire(&self, key: SessionKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > PRUNE_THRESHOLD {
                // Entries referenced only by the table have no holder and no waiter
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of tracked sessions
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
