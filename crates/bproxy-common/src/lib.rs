use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum BridgeConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV > built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding one JSON credential file per account.
    pub accounts_dir: String,
    /// OAuth client used for code exchange and token refresh.
    pub client_id: String,
    pub client_secret: String,
    /// Seconds before expiry at which a token is considered stale.
    pub refresh_skew_secs: i64,
    /// Inclusive port range scanned for the loopback redirect listener.
    pub redirect_port_start: u16,
    pub redirect_port_end: u16,
    /// Base URL of the upstream chat service.
    pub upstream_base_url: String,
}

/// Optional layer used when merging config sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub accounts_dir: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_skew_secs: Option<i64>,
    pub redirect_port_start: Option<u16>,
    pub redirect_port_end: Option<u16>,
    pub upstream_base_url: Option<String>,
}

impl BridgeConfigPatch {
    pub fn overlay(&mut self, other: BridgeConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.accounts_dir.is_some() {
            self.accounts_dir = other.accounts_dir;
        }
        if other.client_id.is_some() {
            self.client_id = other.client_id;
        }
        if other.client_secret.is_some() {
            self.client_secret = other.client_secret;
        }
        if other.refresh_skew_secs.is_some() {
            self.refresh_skew_secs = other.refresh_skew_secs;
        }
        if other.redirect_port_start.is_some() {
            self.redirect_port_start = other.redirect_port_start;
        }
        if other.redirect_port_end.is_some() {
            self.redirect_port_end = other.redirect_port_end;
        }
        if other.upstream_base_url.is_some() {
            self.upstream_base_url = other.upstream_base_url;
        }
    }

    pub fn into_config(self) -> Result<BridgeConfig, BridgeConfigError> {
        Ok(BridgeConfig {
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(8788),
            accounts_dir: self
                .accounts_dir
                .unwrap_or_else(|| "accounts".to_string()),
            client_id: self
                .client_id
                .ok_or(BridgeConfigError::MissingField("client_id"))?,
            client_secret: self
                .client_secret
                .ok_or(BridgeConfigError::MissingField("client_secret"))?,
            refresh_skew_secs: self.refresh_skew_secs.unwrap_or(300),
            redirect_port_start: self.redirect_port_start.unwrap_or(1455),
            redirect_port_end: self.redirect_port_end.unwrap_or(1475),
            upstream_base_url: self
                .upstream_base_url
                .ok_or(BridgeConfigError::MissingField("upstream_base_url"))?,
        })
    }
}

impl From<BridgeConfig> for BridgeConfigPatch {
    fn from(value: BridgeConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            accounts_dir: Some(value.accounts_dir),
            client_id: Some(value.client_id),
            client_secret: Some(value.client_secret),
            refresh_skew_secs: Some(value.refresh_skew_secs),
            redirect_port_start: Some(value.redirect_port_start),
            redirect_port_end: Some(value.redirect_port_end),
            upstream_base_url: Some(value.upstream_base_url),
        }
    }
}

/// Mints a sortable identifier for a newly registered account.
pub fn new_account_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Mints the downstream-visible id for one streamed completion.
pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::now_v7().simple())
}

/// Mints the identity under which an exchange can be resumed later.
pub fn new_conversation_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layers() {
        let mut base = BridgeConfigPatch {
            host: Some("0.0.0.0".to_string()),
            port: Some(9000),
            ..Default::default()
        };
        base.overlay(BridgeConfigPatch {
            port: Some(9001),
            client_id: Some("cid".to_string()),
            ..Default::default()
        });
        assert_eq!(base.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(base.port, Some(9001));
        assert_eq!(base.client_id.as_deref(), Some("cid"));
    }

    #[test]
    fn into_config_requires_oauth_client() {
        let patch = BridgeConfigPatch {
            upstream_base_url: Some("https://chat.example.com".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            patch.into_config(),
            Err(BridgeConfigError::MissingField("client_id"))
        ));
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let patch = BridgeConfigPatch {
            client_id: Some("cid".to_string()),
            client_secret: Some("cs".to_string()),
            upstream_base_url: Some("https://chat.example.com".to_string()),
            ..Default::default()
        };
        let config = patch.into_config().unwrap();
        assert_eq!(config.refresh_skew_secs, 300);
        assert_eq!(config.redirect_port_start, 1455);
        assert_eq!(config.port, 8788);
    }
}
