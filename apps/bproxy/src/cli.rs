use bproxy_common::BridgeConfigPatch;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "bproxy", version, about = "Bridges browser-hosted chat services to an OpenAI-compatible streaming API")]
pub struct Cli {
    #[arg(long, env = "BPROXY_HOST")]
    pub host: Option<String>,
    #[arg(long, env = "BPROXY_PORT")]
    pub port: Option<u16>,
    /// Directory holding one JSON credential file per account.
    #[arg(long, env = "BPROXY_ACCOUNTS_DIR")]
    pub accounts_dir: Option<String>,
    #[arg(long, env = "BPROXY_CLIENT_ID")]
    pub client_id: Option<String>,
    #[arg(long, env = "BPROXY_CLIENT_SECRET")]
    pub client_secret: Option<String>,
    /// Seconds before expiry at which tokens are refreshed ahead of use.
    #[arg(long, env = "BPROXY_REFRESH_SKEW_SECS")]
    pub refresh_skew_secs: Option<i64>,
    /// First port tried for the loopback OAuth redirect listener.
    #[arg(long, env = "BPROXY_REDIRECT_PORT_START")]
    pub redirect_port_start: Option<u16>,
    /// Last port tried for the loopback OAuth redirect listener.
    #[arg(long, env = "BPROXY_REDIRECT_PORT_END")]
    pub redirect_port_end: Option<u16>,
    #[arg(long, env = "BPROXY_UPSTREAM_BASE_URL")]
    pub upstream_base_url: Option<String>,
}

impl Cli {
    pub fn into_patch(self) -> BridgeConfigPatch {
        BridgeConfigPatch {
            host: self.host,
            port: self.port,
            accounts_dir: self.accounts_dir,
            client_id: self.client_id,
            client_secret: self.client_secret,
            refresh_skew_secs: self.refresh_skew_secs,
            redirect_port_start: self.redirect_port_start,
            redirect_port_end: self.redirect_port_end,
            upstream_base_url: self.upstream_base_url,
        }
    }
}
