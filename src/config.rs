use crate::hls::LinkMode;
use crate::referrer::HostDefaults;
use crate::relay::DEFAULT_USER_AGENT;
use crate::token::KEY_LEN;
use std::env;
use std::time::Duration;
use tracing::warn;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub is_dev: bool,
    /// Externally reachable prefix for rewritten links; empty for root-relative links
    pub public_base_url: String,
    /// Link style for rewritten references on `/m3u8`
    pub link_mode: LinkMode,
    /// AES-256 key for opaque tokens
    pub secret_key: Option<Vec<u8>>,
    /// Per-host referer quirks
    pub referer_defaults: HostDefaults,
    pub upstream_connect_timeout: Duration,
    /// Skip the private-address check on caller-supplied targets
    pub allow_private_upstreams: bool,
    pub user_agent: String,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT is required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        // Port: required in prod, defaults to 3000 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .map(|base| base.trim_end_matches('/').to_string())
            .unwrap_or_default();
        if !public_base_url.is_empty() {
            url::Url::parse(&public_base_url)
                .map_err(|e| format!("PUBLIC_BASE_URL is not a valid URL: {e}"))?;
        }

        let link_mode = match env::var("LINK_MODE")
            .unwrap_or_else(|_| "transparent".to_string())
            .to_lowercase()
            .as_str()
        {
            "tokenized" | "opaque" => LinkMode::Tokenized,
            "transparent" => LinkMode::Transparent,
            other => return Err(format!("unknown LINK_MODE '{other}'").into()),
        };

        let secret_key = env::var("SECRET_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .map(String::into_bytes);
        match &secret_key {
            Some(key) if key.len() != KEY_LEN => warn!(
                "SECRET_KEY is {} bytes, expected {}; opaque routes will fail",
                key.len(),
                KEY_LEN
            ),
            None if link_mode == LinkMode::Tokenized => {
                return Err("SECRET_KEY is required when LINK_MODE=tokenized".into());
            }
            _ => {}
        }

        let referer_defaults = match env::var("REFERER_DEFAULTS") {
            Ok(raw) if !raw.trim().is_empty() => HostDefaults::from_json(&raw)
                .map_err(|e| format!("REFERER_DEFAULTS is not valid: {e}"))?,
            _ => HostDefaults::new(),
        };

        let connect_timeout_secs: u64 = env::var("UPSTREAM_CONNECT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .unwrap_or(10);

        let allow_private_upstreams = env::var("ALLOW_PRIVATE_UPSTREAMS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(is_dev);

        let user_agent =
            env::var("USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string());

        Ok(Config {
            port,
            is_dev,
            public_base_url,
            link_mode,
            secret_key,
            referer_defaults,
            upstream_connect_timeout: Duration::from_secs(connect_timeout_secs),
            allow_private_upstreams,
            user_agent,
        })
    }

    /// Dev defaults without consulting the environment
    pub fn dev() -> Self {
        Config {
            port: 3000,
            is_dev: true,
            public_base_url: String::new(),
            link_mode: LinkMode::Transparent,
            secret_key: None,
            referer_defaults: HostDefaults::new(),
            upstream_connect_timeout: Duration::from_secs(10),
            allow_private_upstreams: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}
