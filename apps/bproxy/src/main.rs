use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::info;

mod cli;
mod routes;

use bproxy_auth::{
    AccessSerializer, CallbackRegistry, CredentialPool, CredentialStore, OAuthClient, OAuthConfig,
};
use bproxy_common::BridgeConfig;
use bproxy_core::{EngineConfig, ExchangeEngine};

use crate::cli::Cli;
use crate::routes::AppState;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("bproxy failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    let config: BridgeConfig = cli.into_patch().into_config()?;
    info!(
        host = %config.host,
        port = config.port,
        accounts_dir = %config.accounts_dir,
        upstream = %config.upstream_base_url,
        refresh_skew_secs = config.refresh_skew_secs,
        "config loaded"
    );

    let oauth = Arc::new(OAuthClient::new(OAuthConfig::new(
        config.client_id.clone(),
        config.client_secret.clone(),
    ))?);

    let store = CredentialStore::new(&config.accounts_dir);
    let pool = Arc::new(CredentialPool::new(
        store,
        oauth.clone(),
        config.refresh_skew_secs,
    ));
    let loaded = pool.load_all().await?;
    info!(credentials = loaded, "pool ready");

    let serializer = Arc::new(AccessSerializer::new());
    let engine = ExchangeEngine::new(
        pool.clone(),
        serializer,
        EngineConfig::new(config.upstream_base_url.clone()),
    )?;

    // The loopback redirect listener gets its own port, scanned from the
    // configured range, so the registered redirect URI stays stable even
    // when the API port changes.
    let redirect_listener =
        bind_loopback(config.redirect_port_start, config.redirect_port_end).await?;
    let redirect_port = redirect_listener.local_addr()?.port();
    let redirect_uri = format!("http://localhost:{redirect_port}/oauth/callback");
    info!(redirect_uri = %redirect_uri, "oauth redirect listener bound");

    let state = Arc::new(AppState {
        engine,
        pool,
        oauth,
        registry: Arc::new(CallbackRegistry::new()),
        redirect_uri,
        pending_waits: Mutex::new(HashMap::new()),
    });

    let callback_app = axum::Router::new()
        .route("/oauth/callback", axum::routing::get(routes::oauth_callback))
        .with_state(state.clone());
    tokio::spawn(async move {
        if let Err(err) = axum::serve(redirect_listener, callback_app).await {
            tracing::error!(error = %err, "oauth redirect listener stopped");
        }
    });

    let app = axum::Router::new()
        .route(
            "/v1/chat/completions",
            axum::routing::post(routes::chat_completions),
        )
        .route("/oauth/start", axum::routing::get(routes::oauth_start))
        .route("/oauth/wait", axum::routing::get(routes::oauth_wait))
        .with_state(state);

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn bind_loopback(
    start: u16,
    end: u16,
) -> Result<tokio::net::TcpListener, Box<dyn Error + Send + Sync>> {
    for port in start..=end {
        match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok(listener),
            Err(_) => continue,
        }
    }
    Err(format!("no free loopback port in {start}..={end}").into())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
