//! Endpoint configuration: base URL, API key and websocket URL derivation

use anyhow::{anyhow, Context, Result};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const BASE_URL_ENV: &str = "HYPEMAN_BASE_URL";
pub const API_KEY_ENV: &str = "HYPEMAN_API_KEY";

#[derive(Clone)]
pub struct Config {
    pub base_url: Url,
    pub api_key: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl Config {
    /// Load from the `--base-url` flag and the process environment.
    pub fn load(base_url_flag: Option<&str>) -> Result<Self> {
        let env_base = std::env::var(BASE_URL_ENV).ok();
        let api_key = std::env::var(API_KEY_ENV).ok();
        Self::from_parts(base_url_flag, env_base.as_deref(), api_key)
    }

    /// Flag wins over environment, environment over the built-in default.
    /// A missing or empty API key is a hard failure.
    pub fn from_parts(
        flag: Option<&str>,
        env_base: Option<&str>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let base = flag
            .filter(|s| !s.is_empty())
            .or(env_base.filter(|s| !s.is_empty()))
            .unwrap_or(DEFAULT_BASE_URL);
        let base_url = Url::parse(base).with_context(|| format!("invalid base URL: {}", base))?;
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow!("{} environment variable required", API_KEY_ENV))?;
        Ok(Config { base_url, api_key })
    }

    /// `/instances/{id}/{endpoint}` with `http→ws` / `https→wss`
    pub fn websocket_url(&self, instance_id: &str, endpoint: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.set_path(&format!("/instances/{}/{}", instance_id, endpoint));
        url.set_query(None);
        let scheme = match url.scheme() {
            "https" => Some("wss"),
            "http" => Some("ws"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| anyhow!("cannot switch {} to websocket scheme", url))?;
        }
        Ok(url)
    }

    /// REST URL for `path` under the base URL
    pub fn api_url(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{}{}", base, path)).with_context(|| format!("invalid API path: {}", path))
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }
}
