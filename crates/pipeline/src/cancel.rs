//! Cancellation tokens for in-flight completions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Tokens keyed by conversation id (or request id for inline builds).
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<RwLock<HashMap<String, (u64, CancellationToken)>>>,
    next: Arc<AtomicU64>,
}

/// Returned by [`CancelRegistry::register`]; pass back to `release`.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    pub key: String,
    generation: u64,
    pub token: CancellationToken,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh token for `key`, replacing (and cancelling) any previous one.
    pub async fn register(&self, key: &str) -> CancelHandle {
        let generation = self.next.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self
            .tokens
            .write()
            .await
            .insert(key.to_string(), (generation, token.clone()));
        if let Some((_, stale)) = previous {
            stale.cancel();
        }
        CancelHandle {
            key: key.to_string(),
            generation,
            token,
        }
    }

    /// Cancel whatever is running under `key`.
    pub async fn cancel(&self, key: &str) -> bool {
        match self.tokens.write().await.remove(key) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget the token, unless a newer request has taken the key.
    pub async fn release(&self, handle: &CancelHandle) {
        let mut tokens = self.tokens.write().await;
        if tokens.get(&handle.key).is_some_and(|(g, _)| *g == handle.generation) {
            tokens.remove(&handle.key);
        }
    }

    pub async fn is_active(&self, key: &str) -> bool {
        self.tokens.read().await.contains_key(key)
    }
}
