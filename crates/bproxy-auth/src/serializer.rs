use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Holding this guard is holding the identity's lock. Dropping it releases
/// the lock exactly once, from whichever task the guard was moved into.
pub struct AccessGuard {
    _permit: OwnedMutexGuard<()>,
}

/// Per upstream-identity single-flight lock registry.
///
/// Upstream sessions are stateful per identity, so at most one request may be
/// in flight against an identity at a time; requests for different identities
/// proceed in parallel. Waiters on one identity are served in FIFO order by
/// the underlying mutex. Locks are created lazily on first use; the registry
/// map is guarded by its own short-lived lock, never held while caller code
/// runs.
#[derive(Default)]
pub struct AccessSerializer {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AccessSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, identity: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Blocks until the identity's lock is free, with no timeout. Callers
    /// needing a bounded wait wrap this themselves.
    pub async fn acquire(&self, identity: &str) -> AccessGuard {
        let handle = self.handle(identity);
        AccessGuard {
            _permit: handle.lock_owned().await,
        }
    }

    /// Runs `f` while holding the identity's lock. The lock is released on
    /// every exit path, including errors propagated out of `f`.
    pub async fn with_lock<T, F, Fut>(&self, identity: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(identity).await;
        f().await
    }
}
