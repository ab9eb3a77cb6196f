//! Endpoint and credential configuration.

use thiserror::Error;
use url::Url;

pub const API_URL_VAR: &str = "STORY_SYNC_API_URL";
pub const WS_URL_VAR: &str = "STORY_SYNC_WS_URL";
pub const TOKEN_VAR: &str = "STORY_SYNC_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} is not a valid URL ({value:?}): {source}")]
    InvalidUrl {
        name: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("cannot derive a WebSocket URL from scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("auth token is empty")]
    EmptyToken,
}

/// Where the backend lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base URL of the REST API (e.g. `https://stories.example.com`)
    pub api_url: Url,
    /// Push channel endpoint. Derived from `api_url` when not given.
    pub ws_url: Url,
    /// Bearer token for REST calls and the push channel handshake
    pub token: String,
}

impl SyncConfig {
    /// Read `STORY_SYNC_API_URL`, `STORY_SYNC_WS_URL` (optional) and
    /// `STORY_SYNC_TOKEN`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = lookup(API_URL_VAR).ok_or(ConfigError::Missing(API_URL_VAR))?;
        let ws_url = lookup(WS_URL_VAR).filter(|value| !value.is_empty());
        let token = lookup(TOKEN_VAR).ok_or(ConfigError::Missing(TOKEN_VAR))?;
        Self::from_parts(&api_url, ws_url.as_deref(), &token)
    }

    pub fn from_parts(api_url: &str, ws_url: Option<&str>, token: &str) -> Result<Self, ConfigError> {
        if token.trim().is_empty() {
            return Err(ConfigError::EmptyToken);
        }
        let api_url = parse_url(API_URL_VAR, api_url)?;
        let ws_url = match ws_url {
            Some(ws_url) => parse_url(WS_URL_VAR, ws_url)?,
            None => derive_ws_url(&api_url)?,
        };
        Ok(Self {
            api_url,
            ws_url,
            token: token.to_string(),
        })
    }
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
        name,
        value: value.to_string(),
        source,
    })
}

/// `http(s)://host[:port]/...` becomes `ws(s)://host[:port]/ws`.
pub fn derive_ws_url(api_url: &Url) -> Result<Url, ConfigError> {
    let scheme = match api_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => api_url.scheme(),
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };

    let mut ws_url = api_url.clone();
    ws_url
        .set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(api_url.scheme().to_string()))?;
    ws_url.set_path("/ws");
    ws_url.set_query(None);
    ws_url.set_fragment(None);
    Ok(ws_url)
}
