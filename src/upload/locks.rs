//! Per-token lock registry
//!
//! Serializes state transitions on one upload session while letting
//! different sessions proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct TokenLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl TokenLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `token`
    pub async fn lock(&self, token: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock();
            // Drop entries nobody holds or waits on
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(token.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Number of tokens currently tracked
    pub fn tracked(&self) -> usize {
        self.inner.lock().len()
    }
}
