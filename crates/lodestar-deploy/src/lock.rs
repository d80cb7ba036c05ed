//! Named mutual exclusion keyed by string.
//!
//! Callers with the same key run their critical sections one after another in
//! arrival order; different keys never wait on each other. The lock is held
//! for the lifetime of the future and released when it finishes, including
//! when it returns an error.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::trace;

/// Per-key async mutex registry.
#[derive(Debug, Default)]
pub struct ConcurrencyGuard {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConcurrencyGuard {
    /// Create an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` while holding the lock for `key`.
    pub async fn using_lock<F, T>(&self, key: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        // Clone the Arc out so no DashMap shard guard is held across the await.
        let lock = Arc::clone(
            self.locks
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        let output = {
            let _held = lock.lock().await;
            trace!(key, "lock acquired");
            fut.await
        };

        drop(lock);
        // Drop the entry once nobody else holds or waits on it.
        self.locks
            .remove_if(key, |_, l| Arc::strong_count(l) == 1);

        output
    }

    /// Number of keys with a live lock entry.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }
}
