use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One upstream identity held in memory.
///
/// `refresh_token` is immutable once set: a refresh replaces `access_token`
/// and `expires_at` together and touches the refresh token only when the
/// server issued a new one.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch seconds at which `access_token` expires.
    pub expires_at: i64,
    /// Upstream-assigned or synthesized project scope, when the provider has one.
    pub project_id: Option<String>,
    /// Back-reference to the persisted file; not an ownership relation.
    pub storage_path: PathBuf,
}

impl Credential {
    /// Stale when `now` is within `skew_secs` of expiry (or past it).
    pub fn is_stale(&self, now: i64, skew_secs: i64) -> bool {
        now >= self.expires_at - skew_secs
    }

    /// Applies a refresh result. Token and expiry are replaced together;
    /// an absent refresh token in the response keeps the stored one.
    pub fn apply_refresh(&mut self, tokens: &TokenSet, now: i64) {
        self.access_token = tokens.access_token.clone();
        self.expires_at = now + tokens.expires_in;
        if let Some(refresh_token) = tokens.refresh_token.as_deref()
            && !refresh_token.is_empty()
        {
            self.refresh_token = refresh_token.to_string();
        }
    }

    /// Key under which requests for this credential are serialized.
    pub fn identity(&self) -> String {
        format!("bridge:{}", self.id)
    }
}

/// Result of a code exchange or a token refresh.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    /// Absent when the account granted consent previously (exchange) or when
    /// the server chose not to rotate it (refresh).
    pub refresh_token: Option<String>,
    /// Validity of `access_token`, in seconds.
    pub expires_in: i64,
}

/// Subset of the user-info response the bridge needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        Credential {
            id: "a1".to_string(),
            email: "a@example.com".to_string(),
            access_token: "old-access".to_string(),
            refresh_token: "old-refresh".to_string(),
            expires_at: 1_000,
            project_id: None,
            storage_path: PathBuf::from("a1.json"),
        }
    }

    #[test]
    fn staleness_respects_skew_window() {
        let cred = credential();
        assert!(!cred.is_stale(600, 300));
        assert!(cred.is_stale(700, 300));
        assert!(cred.is_stale(1_500, 300));
    }

    #[test]
    fn refresh_without_rotation_keeps_refresh_token() {
        let mut cred = credential();
        cred.apply_refresh(
            &TokenSet {
                access_token: "new-access".to_string(),
                refresh_token: None,
                expires_in: 3_600,
            },
            2_000,
        );
        assert_eq!(cred.access_token, "new-access");
        assert_eq!(cred.expires_at, 5_600);
        assert_eq!(cred.refresh_token, "old-refresh");
    }

    #[test]
    fn refresh_with_rotation_replaces_refresh_token() {
        let mut cred = credential();
        cred.apply_refresh(
            &TokenSet {
                access_token: "new-access".to_string(),
                refresh_token: Some("new-refresh".to_string()),
                expires_in: 60,
            },
            2_000,
        );
        assert_eq!(cred.refresh_token, "new-refresh");
    }
}
