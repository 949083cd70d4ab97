use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tracing::{info, warn};

use bproxy_auth::{
    generate_state, AcquireError, CallbackOutcome, CallbackRegistry, Credential, CredentialPool,
    OAuthClient, OAuthError, AUTH_WAIT_SECS,
};
use bproxy_common::new_account_id;
use bproxy_core::{EngineError, ExchangeEngine};
use bproxy_protocol::ChatRequest;

pub struct AppState {
    pub engine: ExchangeEngine,
    pub pool: Arc<CredentialPool>,
    pub oauth: Arc<OAuthClient>,
    pub registry: Arc<CallbackRegistry>,
    pub redirect_uri: String,
    /// Receivers parked between /oauth/start and /oauth/wait.
    pub pending_waits: Mutex<HashMap<String, PendingWait>>,
}

pub struct PendingWait {
    pub rx: oneshot::Receiver<CallbackOutcome>,
    pub parked_at: tokio::time::Instant,
}

/// Drops parked receivers older than the authorization window, so sign-ins
/// that never reach /oauth/wait do not accumulate.
fn prune_waits(waits: &mut HashMap<String, PendingWait>) {
    let deadline = std::time::Duration::from_secs(AUTH_WAIT_SECS);
    waits.retain(|_, wait| wait.parked_at.elapsed() < deadline);
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if !request.stream {
        return error_response(
            StatusCode::BAD_REQUEST,
            "only streaming requests are supported; set \"stream\": true",
        );
    }
    match state.engine.stream_chat(request).await {
        Ok(stream) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(err) => engine_error_response(err),
    }
}

fn engine_error_response(err: EngineError) -> Response {
    let status = match &err {
        EngineError::Acquire(AcquireError::PoolEmpty) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Acquire(_) => StatusCode::BAD_GATEWAY,
        EngineError::Upstream(_) | EngineError::UpstreamStatus { .. } => StatusCode::BAD_GATEWAY,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "error": { "message": message, "type": "bridge_error" } })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    pub state: String,
}

pub async fn oauth_start(State(state): State<Arc<AppState>>) -> Response {
    let auth_state = generate_state();
    let rx = state.registry.register(&auth_state);
    if let Ok(mut waits) = state.pending_waits.lock() {
        prune_waits(&mut waits);
        waits.insert(
            auth_state.clone(),
            PendingWait {
                rx,
                parked_at: tokio::time::Instant::now(),
            },
        );
    }
    let auth_url = state.oauth.build_auth_url(&state.redirect_uri, &auth_state);
    Json(json!({
        "auth_url": auth_url,
        "state": auth_state,
        "redirect_uri": state.redirect_uri,
    }))
    .into_response()
}

/// Blocks until the matching callback arrives, bounded by the registry's
/// five-minute timeout.
pub async fn oauth_wait(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WaitQuery>,
) -> Response {
    let parked = state
        .pending_waits
        .lock()
        .ok()
        .and_then(|mut waits| waits.remove(&query.state));
    let Some(parked) = parked else {
        return error_response(StatusCode::NOT_FOUND, "unknown or already-claimed state");
    };
    match state.registry.wait(&query.state, parked.rx).await {
        Ok(CallbackOutcome::Authorized { .. }) => {
            Json(json!({ "status": "authorized" })).into_response()
        }
        Ok(CallbackOutcome::Denied { error }) => {
            error_response(StatusCode::UNAUTHORIZED, &format!("authorization denied: {error}"))
        }
        Err(err @ OAuthError::Timeout(_)) => {
            error_response(StatusCode::GATEWAY_TIMEOUT, &err.to_string())
        }
        Err(err) => error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Loopback redirect target: exchanges the code, registers the credential,
/// and wakes any waiter for this state.
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let auth_state = query.state.unwrap_or_default();

    if let Some(error) = query.error {
        let detail = query.error_description.unwrap_or_else(|| error.clone());
        state
            .registry
            .complete(&auth_state, CallbackOutcome::Denied { error: detail.clone() });
        return Html(format!("<h3>Sign-in failed</h3><p>{detail}</p>")).into_response();
    }
    let Some(code) = query.code else {
        return error_response(StatusCode::BAD_REQUEST, "missing code");
    };

    match register_account(&state, &code).await {
        Ok((email, had_refresh_token)) => {
            state
                .registry
                .complete(&auth_state, CallbackOutcome::Authorized { code });
            info!(email = %email, "account registered");
            let warning = if had_refresh_token {
                ""
            } else {
                "<p><b>Warning:</b> no refresh token was issued; this account will stop \
                 working when its access token expires. Revoke the app's access and sign \
                 in again to get a refresh token.</p>"
            };
            Html(format!(
                "<h3>Signed in as {email}</h3><p>You can close this window.</p>{warning}"
            ))
            .into_response()
        }
        Err(err) => {
            warn!(error = %err, "account registration failed");
            error_response(StatusCode::BAD_GATEWAY, &err.to_string())
        }
    }
}

async fn register_account(
    state: &AppState,
    code: &str,
) -> Result<(String, bool), Box<dyn std::error::Error + Send + Sync>> {
    let tokens = state.oauth.exchange_code(code, &state.redirect_uri).await?;
    let profile = state.oauth.fetch_profile(&tokens.access_token).await?;
    let had_refresh_token = tokens.refresh_token.is_some();

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let credential = Credential {
        id: new_account_id(),
        email: profile.email.clone(),
        access_token: tokens.access_token.clone(),
        refresh_token: tokens.refresh_token.clone().unwrap_or_default(),
        expires_at: now + tokens.expires_in,
        project_id: None,
        storage_path: Default::default(),
    };
    state.pool.add(credential).await?;
    Ok((profile.email, had_refresh_token))
}
