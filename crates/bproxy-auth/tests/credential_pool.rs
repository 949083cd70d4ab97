use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bproxy_auth::{
    AcquireError, Credential, CredentialPool, CredentialStore, OAuthError, TokenRefresher, TokenSet,
};
use time::OffsetDateTime;

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn credential(id: &str, expires_at: i64) -> Credential {
    Credential {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        access_token: format!("access-{id}"),
        refresh_token: format!("refresh-{id}"),
        expires_at,
        project_id: None,
        storage_path: PathBuf::new(),
    }
}

/// Counts refreshes; sleeps briefly so concurrent callers overlap the
/// refresh window.
struct CountingRefresher {
    calls: AtomicUsize,
    rotate_refresh_token: bool,
}

impl CountingRefresher {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            rotate_refresh_token: false,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for CountingRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenSet, OAuthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(TokenSet {
            access_token: format!("fresh-{n}"),
            refresh_token: self
                .rotate_refresh_token
                .then(|| format!("rotated-{n}")),
            expires_in: 3600,
        })
    }
}

struct FailingRefresher;

#[async_trait]
impl TokenRefresher for FailingRefresher {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenSet, OAuthError> {
        Err(OAuthError::Rejected {
            endpoint: "token(refresh)",
            status: 400,
            body: "invalid_grant".to_string(),
        })
    }
}

async fn pool_with(
    dir: &std::path::Path,
    refresher: Arc<dyn TokenRefresher>,
    credentials: &[Credential],
) -> CredentialPool {
    let store = CredentialStore::new(dir);
    for credential in credentials {
        store.create(credential).unwrap();
    }
    let pool = CredentialPool::new(store, refresher, 300);
    pool.load_all().await.unwrap();
    pool
}

#[tokio::test]
async fn empty_pool_is_a_distinct_error() {
    let tmp = tempfile::tempdir().unwrap();
    let pool = pool_with(tmp.path(), Arc::new(CountingRefresher::new()), &[]).await;
    assert!(matches!(pool.acquire().await, Err(AcquireError::PoolEmpty)));
}

#[tokio::test]
async fn round_robin_visits_each_credential_once_per_cycle() {
    let tmp = tempfile::tempdir().unwrap();
    let fresh = now() + 100_000;
    let creds: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|id| credential(id, fresh))
        .collect();
    let pool = pool_with(tmp.path(), Arc::new(CountingRefresher::new()), &creds).await;

    let mut seen: HashMap<String, usize> = HashMap::new();
    for _ in 0..6 {
        let cred = pool.acquire().await.unwrap();
        *seen.entry(cred.id).or_default() += 1;
    }
    assert_eq!(seen.len(), 3);
    assert!(seen.values().all(|count| *count == 2), "visits: {seen:?}");
}

#[tokio::test]
async fn concurrent_acquires_refresh_exactly_once() {
    let tmp = tempfile::tempdir().unwrap();
    let refresher = Arc::new(CountingRefresher::new());
    let stale = now() - 10;
    let pool = Arc::new(
        pool_with(tmp.path(), refresher.clone(), &[credential("a", stale)]).await,
    );

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move { pool.acquire().await }));
    }
    for task in tasks {
        let cred = task.await.unwrap().unwrap();
        assert!(cred.access_token.starts_with("fresh-"));
        assert!(cred.expires_at > now() + 290);
    }
    assert_eq!(refresher.calls(), 1, "refresh must be single-flight");
}

#[tokio::test]
async fn refresh_response_without_refresh_token_preserves_stored_one() {
    let tmp = tempfile::tempdir().unwrap();
    let pool = pool_with(
        tmp.path(),
        Arc::new(CountingRefresher::new()),
        &[credential("a", now() - 10)],
    )
    .await;

    let cred = pool.acquire().await.unwrap();
    assert_eq!(cred.refresh_token, "refresh-a");

    // On-disk record keeps the original refresh token too.
    let raw = std::fs::read_to_string(tmp.path().join("a.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["token"]["refresh_token"], "refresh-a");
}

#[tokio::test]
async fn expired_credential_is_refreshed_and_persisted() {
    let tmp = tempfile::tempdir().unwrap();
    let pool = pool_with(
        tmp.path(),
        Arc::new(CountingRefresher::new()),
        &[credential("a", now() - 10)],
    )
    .await;

    let cred = pool.acquire().await.unwrap();
    assert!(cred.expires_at > now() + 290);

    let raw = std::fs::read_to_string(tmp.path().join("a.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["token"]["access_token"], cred.access_token.as_str());
    assert_eq!(doc["token"]["expiry_timestamp"], cred.expires_at);
    assert_eq!(doc["id"], "a");
    assert_eq!(doc["email"], "a@example.com");
}

#[tokio::test]
async fn refresh_failure_surfaces_and_leaves_credential_stale() {
    let tmp = tempfile::tempdir().unwrap();
    let pool = pool_with(
        tmp.path(),
        Arc::new(FailingRefresher),
        &[credential("a", now() - 10)],
    )
    .await;

    match pool.acquire().await {
        Err(AcquireError::RefreshFailed { email, .. }) => {
            assert_eq!(email, "a@example.com");
        }
        other => panic!("expected RefreshFailed, got {other:?}"),
    }

    // The stale token was not clobbered; the next acquire retries the refresh.
    let raw = std::fs::read_to_string(tmp.path().join("a.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(doc["token"]["access_token"], "access-a");
    assert!(matches!(
        pool.acquire().await,
        Err(AcquireError::RefreshFailed { .. })
    ));
}

#[tokio::test]
async fn rotated_refresh_token_is_adopted() {
    let tmp = tempfile::tempdir().unwrap();
    let refresher = Arc::new(CountingRefresher {
        calls: AtomicUsize::new(0),
        rotate_refresh_token: true,
    });
    let pool = pool_with(tmp.path(), refresher, &[credential("a", now() - 10)]).await;

    let cred = pool.acquire().await.unwrap();
    assert_eq!(cred.refresh_token, "rotated-0");
}
