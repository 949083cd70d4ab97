use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::oauth::OAuthError;

/// How long an authorization may stay pending before the wait gives up.
pub const AUTH_WAIT_SECS: u64 = 300;

/// What came back on the loopback redirect.
#[derive(Debug)]
pub enum CallbackOutcome {
    Authorized { code: String },
    Denied { error: String },
}

struct PendingAuth {
    tx: oneshot::Sender<CallbackOutcome>,
    registered_at: Instant,
}

/// Pending-authorization registry keyed by the opaque `state` value.
///
/// `register` hands out a receiver; the loopback callback handler calls
/// `complete`; `wait` bounds the receiver with a five-minute timeout and
/// removes the registration on timeout, so a stale future can never be
/// completed later. Registrations that are simply abandoned (no callback,
/// no waiter) are swept out by age on the next `register`.
#[derive(Default)]
pub struct CallbackRegistry {
    pending: Mutex<HashMap<String, PendingAuth>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, state: &str) -> oneshot::Receiver<CallbackOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let deadline = Duration::from_secs(AUTH_WAIT_SECS);
        pending.retain(|_, auth| auth.registered_at.elapsed() < deadline);
        pending.insert(
            state.to_string(),
            PendingAuth {
                tx,
                registered_at: Instant::now(),
            },
        );
        rx
    }

    /// Fires the pending waiter for `state`. Returns false when no waiter is
    /// registered (unknown state, or one that already timed out).
    pub fn complete(&self, state: &str, outcome: CallbackOutcome) -> bool {
        let sender = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.remove(state)
        };
        match sender {
            Some(auth) => auth.tx.send(outcome).is_ok(),
            None => {
                debug!(state, "callback for unknown or expired state");
                false
            }
        }
    }

    /// Awaits the outcome for a registration made earlier with [`register`].
    ///
    /// [`register`]: CallbackRegistry::register
    pub async fn wait(
        &self,
        state: &str,
        rx: oneshot::Receiver<CallbackOutcome>,
    ) -> Result<CallbackOutcome, OAuthError> {
        match timeout(Duration::from_secs(AUTH_WAIT_SECS), rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            // Sender dropped without completing, or the clock ran out: either
            // way the registration must not linger.
            Ok(Err(_)) | Err(_) => {
                let mut pending = self
                    .pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                pending.remove(state);
                Err(OAuthError::Timeout(AUTH_WAIT_SECS))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completion_reaches_the_waiter() {
        let registry = CallbackRegistry::new();
        let rx = registry.register("s1");
        assert!(registry.complete(
            "s1",
            CallbackOutcome::Authorized {
                code: "c0de".to_string(),
            },
        ));
        match registry.wait("s1", rx).await.unwrap() {
            CallbackOutcome::Authorized { code } => assert_eq!(code, "c0de"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_registration() {
        let registry = CallbackRegistry::new();
        let rx = registry.register("s1");

        let waited = registry.wait("s1", rx).await;
        assert!(matches!(waited, Err(OAuthError::Timeout(AUTH_WAIT_SECS))));

        // The stale registration is gone: a late callback finds nothing.
        assert!(!registry.complete(
            "s1",
            CallbackOutcome::Authorized {
                code: "late".to_string(),
            },
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_registration_is_swept_by_the_next_register() {
        let registry = CallbackRegistry::new();
        let mut abandoned_rx = registry.register("abandoned");

        tokio::time::advance(Duration::from_secs(AUTH_WAIT_SECS + 1)).await;
        let _fresh_rx = registry.register("fresh");

        // The sweep dropped the old sender, so a late callback finds nothing
        // and the parked receiver resolves instead of lingering forever.
        assert!(!registry.complete(
            "abandoned",
            CallbackOutcome::Authorized {
                code: "late".to_string(),
            },
        ));
        assert!(abandoned_rx.try_recv().is_err());

        let pending = registry.pending.lock().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending.contains_key("fresh"));
    }

    #[tokio::test]
    async fn unknown_state_is_rejected() {
        let registry = CallbackRegistry::new();
        assert!(!registry.complete(
            "never-registered",
            CallbackOutcome::Denied {
                error: "access_denied".to_string(),
            },
        ));
    }
}
