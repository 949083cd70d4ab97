use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::credential::Credential;
use crate::oauth::{OAuthError, TokenRefresher};
use crate::store::{CredentialStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// Distinct from transient failures: the fix is to register an account,
    /// not to retry.
    #[error("credential pool is empty; register an account before sending requests")]
    PoolEmpty,
    /// The credential stays in the pool unchanged (stale); the next acquire
    /// retries the refresh.
    #[error("token refresh failed for {email}: {source}")]
    RefreshFailed {
        email: String,
        #[source]
        source: OAuthError,
    },
    #[error(transparent)]
    Persist(#[from] StoreError),
}

struct PoolInner {
    credentials: Vec<Credential>,
    cursor: usize,
}

/// Rotating set of account credentials with refresh-ahead.
///
/// Rotation is round-robin over insertion order. A credential within
/// `refresh_skew_secs` of expiry is refreshed before being handed out;
/// the exclusive lock plus a staleness re-check guarantee a single network
/// refresh no matter how many callers observe the stale token concurrently.
pub struct CredentialPool {
    inner: RwLock<PoolInner>,
    store: CredentialStore,
    refresher: Arc<dyn TokenRefresher>,
    refresh_skew_secs: i64,
}

impl CredentialPool {
    pub fn new(
        store: CredentialStore,
        refresher: Arc<dyn TokenRefresher>,
        refresh_skew_secs: i64,
    ) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                credentials: Vec::new(),
                cursor: 0,
            }),
            store,
            refresher,
            refresh_skew_secs,
        }
    }

    /// Clears the pool and reloads every credential file from disk.
    pub async fn load_all(&self) -> Result<usize, StoreError> {
        let credentials = self.store.load_all()?;
        let mut inner = self.inner.write().await;
        info!(count = credentials.len(), "credential pool loaded");
        inner.credentials = credentials;
        inner.cursor = 0;
        Ok(inner.credentials.len())
    }

    /// Persists a newly registered credential and adds it to the rotation.
    pub async fn add(&self, mut credential: Credential) -> Result<(), StoreError> {
        let path = self.store.create(&credential)?;
        credential.storage_path = path;
        let mut inner = self.inner.write().await;
        inner.credentials.push(credential);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.credentials.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.credentials.is_empty()
    }

    pub async fn emails(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner.credentials.iter().map(|c| c.email.clone()).collect()
    }

    /// Returns the next credential in rotation, fresh enough to use.
    ///
    /// Fast path: advance the cursor, clone the candidate, check staleness
    /// outside the lock. Slow path: retake the lock exclusively, re-check
    /// (another caller may have refreshed meanwhile), refresh over the
    /// network, persist, hand the renewed credential out. Refresh failures
    /// are returned, never silently retried.
    pub async fn acquire(&self) -> Result<Credential, AcquireError> {
        let candidate = {
            let mut inner = self.inner.write().await;
            if inner.credentials.is_empty() {
                return Err(AcquireError::PoolEmpty);
            }
            inner.cursor = (inner.cursor + 1) % inner.credentials.len();
            inner.credentials[inner.cursor].clone()
        };

        if !candidate.is_stale(unix_now(), self.refresh_skew_secs) {
            return Ok(candidate);
        }
        self.refresh_locked(&candidate.id).await
    }

    async fn refresh_locked(&self, credential_id: &str) -> Result<Credential, AcquireError> {
        let mut inner = self.inner.write().await;
        let Some(pos) = inner
            .credentials
            .iter()
            .position(|c| c.id == credential_id)
        else {
            // Removed while we waited for the lock.
            return Err(AcquireError::PoolEmpty);
        };

        // Double-check under the exclusive lock: whoever got here first
        // already renewed the token.
        if !inner.credentials[pos].is_stale(unix_now(), self.refresh_skew_secs) {
            debug!(email = %inner.credentials[pos].email, "token already refreshed by another caller");
            return Ok(inner.credentials[pos].clone());
        }

        let refresh_token = inner.credentials[pos].refresh_token.clone();
        let email = inner.credentials[pos].email.clone();
        match self.refresher.refresh(&refresh_token).await {
            Ok(tokens) => {
                inner.credentials[pos].apply_refresh(&tokens, unix_now());
                self.store.persist(&inner.credentials[pos])?;
                info!(email = %email, expires_at = inner.credentials[pos].expires_at, "token refreshed");
                Ok(inner.credentials[pos].clone())
            }
            Err(source) => {
                warn!(email = %email, error = %source, "token refresh failed; credential left stale");
                Err(AcquireError::RefreshFailed { email, source })
            }
        }
    }
}

fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
