//! Per-conversation async mutexes.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

type LockMap = Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>;

/// Serialises writers to the same conversation. Different conversations
/// never contend.
#[derive(Default, Clone)]
pub struct ConversationLocks {
    locks: LockMap,
}

/// Exclusive access to one conversation. Dropping it releases the lock and
/// forgets the conversation's mutex when nobody else holds or waits on it.
pub struct ConversationGuard {
    guard: Option<OwnedMutexGuard<()>>,
    id: String,
    locks: LockMap,
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters clone the mutex under the read lock, so with the write
        // lock held a count of 1 means the map is the only owner. Under
        // contention the entry is left for a later release.
        if let Ok(mut map) = self.locks.try_write() {
            if map.get(&self.id).is_some_and(|m| Arc::strong_count(m) == 1) {
                map.remove(&self.id);
            }
        }
    }
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`. Released when the guard drops.
    pub async fn lock(&self, id: &str) -> ConversationGuard {
        let existing = self.locks.read().await.get(id).cloned();
        let mutex = match existing {
            Some(mutex) => mutex,
            None => self
                .locks
                .write()
                .await
                .entry(id.to_string())
                .or_default()
                .clone(),
        };
        let guard = mutex.lock_owned().await;
        debug!(conversation = id, "Conversation lock acquired");
        ConversationGuard {
            guard: Some(guard),
            id: id.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Conversations with a live mutex.
    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
