//! Per-session lock table
//!
//! Serializes the state-changing steps of one session (chunk commit, merge,
//! cancel, sweep) while leaving different sessions independent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a session
    pub async fn acquire(&self, session_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(session_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Forget the lock of a session that reached a terminal state.
    ///
    /// Must be called while holding the guard returned by [`acquire`].
    ///
    /// [`acquire`]: SessionLocks::acquire
    pub fn release(&self, session_id: Uuid) {
        self.locks.lock().remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
