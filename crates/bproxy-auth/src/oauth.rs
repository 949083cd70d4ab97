use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::credential::{Profile, TokenSet};

pub const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";

/// Fixed, space-joined scope list sent on every authorization.
pub const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("request to {endpoint} failed: {message}")]
    Http {
        endpoint: &'static str,
        message: String,
    },
    #[error("{endpoint} rejected the request ({status}): {body}")]
    Rejected {
        endpoint: &'static str,
        status: u16,
        body: String,
    },
    #[error("{endpoint} returned an unreadable body: {message}")]
    Malformed {
        endpoint: &'static str,
        message: String,
    },
    #[error("authorization was not completed within {0} seconds; retry the sign-in")]
    Timeout(u64),
    #[error("authorization was denied upstream: {0}")]
    Denied(String),
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

impl OAuthConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            userinfo_url: DEFAULT_USERINFO_URL.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ExchangeForm<'a> {
    code: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    redirect_uri: &'a str,
    grant_type: &'static str,
}

#[derive(Serialize)]
struct RefreshForm<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
    grant_type: &'static str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Stateless OAuth request/response functions over one shared client.
///
/// No retries here: retry policy belongs to callers, who know whether the
/// credential set makes retrying safe.
#[derive(Clone)]
pub struct OAuthClient {
    client: wreq::Client,
    config: OAuthConfig,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig) -> Result<Self, OAuthError> {
        let client = wreq::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| OAuthError::Http {
                endpoint: "client",
                message: err.to_string(),
            })?;
        Ok(Self { client, config })
    }

    /// Deterministic authorization URL for the loopback redirect.
    pub fn build_auth_url(&self, redirect_uri: &str, state: &str) -> String {
        let scope = urlencoding::encode(OAUTH_SCOPE);
        let redirect_uri = urlencoding::encode(redirect_uri);
        let client_id = urlencoding::encode(&self.config.client_id);
        format!(
            "{}?response_type=code&client_id={client_id}&redirect_uri={redirect_uri}&scope={scope}&access_type=offline&prompt=consent&state={state}",
            self.config.auth_url.trim_end_matches('/'),
        )
    }

    /// One form POST exchanging an authorization code for tokens.
    ///
    /// A response without a refresh token is not an error: it means the
    /// account granted consent previously. It is logged loudly because the
    /// resulting credential becomes unrefreshable at expiry.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet, OAuthError> {
        let form = ExchangeForm {
            code,
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
            redirect_uri,
            grant_type: "authorization_code",
        };
        let tokens = self.token_request("token(exchange)", &form).await?;
        if tokens.refresh_token.is_none() {
            warn!(
                "code exchange returned no refresh token; the account likely granted consent \
                 before, and this credential cannot be refreshed once it expires"
            );
        }
        Ok(tokens)
    }

    /// One form POST renewing an access token. When the response omits the
    /// refresh token, callers keep the one they already hold.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, OAuthError> {
        let form = RefreshForm {
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
            refresh_token,
            grant_type: "refresh_token",
        };
        self.token_request("token(refresh)", &form).await
    }

    async fn token_request<F: Serialize>(
        &self,
        endpoint: &'static str,
        form: &F,
    ) -> Result<TokenSet, OAuthError> {
        let response = self
            .client
            .post(&self.config.token_url)
            .form(form)
            .send()
            .await
            .map_err(|err| OAuthError::Http {
                endpoint,
                message: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Rejected {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }
        let payload =
            response
                .json::<TokenResponse>()
                .await
                .map_err(|err| OAuthError::Malformed {
                    endpoint,
                    message: err.to_string(),
                })?;
        Ok(TokenSet {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token.filter(|token| !token.is_empty()),
            expires_in: payload.expires_in.unwrap_or(3600),
        })
    }

    /// One bearer GET against the user-info endpoint.
    pub async fn fetch_profile(&self, access_token: &str) -> Result<Profile, OAuthError> {
        let response = self
            .client
            .get(&self.config.userinfo_url)
            .header(http::header::AUTHORIZATION, format!("Bearer {access_token}"))
            .send()
            .await
            .map_err(|err| OAuthError::Http {
                endpoint: "userinfo",
                message: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Rejected {
                endpoint: "userinfo",
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Profile>()
            .await
            .map_err(|err| OAuthError::Malformed {
                endpoint: "userinfo",
                message: err.to_string(),
            })
    }
}

/// Seam between the credential pool and the network: the pool refreshes
/// through this trait so tests can count and stub refreshes.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, OAuthError>;
}

#[async_trait]
impl TokenRefresher for OAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, OAuthError> {
        OAuthClient::refresh(self, refresh_token).await
    }
}

/// Opaque CSRF state for one authorization attempt.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
