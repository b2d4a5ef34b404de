//! Process configuration from command-line flags and environment variables.

use std::path::PathBuf;

use axum::http::{HeaderName, HeaderValue};
use clap::Parser;

use crate::error::ConfigError;
use crate::rate_limit::RateLimitConfig;

const DEFAULT_REMOVE_HEADERS: [&str; 7] = [
    "cookie",
    "cookie2",
    "x-request-start",
    "x-request-id",
    "via",
    "connect-time",
    "total-route-time",
];

#[derive(Parser, Debug, Clone)]
#[command(name = "hls-proxy")]
#[command(about = "CORS proxy with HLS playlist rewriting and range-aware media streaming")]
pub struct Config {
    /// Listen address.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8081)]
    pub port: u16,

    /// Externally visible base URL used in rewritten playlist links.
    #[arg(long, env = "PUBLIC_URL")]
    pub public_url: Option<String>,

    #[arg(long, env = "CORSANYWHERE_BLACKLIST", value_delimiter = ',')]
    pub origin_blacklist: Vec<String>,

    /// When non-empty, only these origins may use the forwarding endpoint.
    #[arg(long, env = "CORSANYWHERE_WHITELIST", value_delimiter = ',')]
    pub origin_whitelist: Vec<String>,

    /// `<max> <periodMinutes> [exempt hosts or /regexes/]`
    #[arg(long, env = "CORSANYWHERE_RATELIMIT")]
    pub rate_limit: Option<String>,

    /// Forwarded requests must carry at least one of these headers.
    #[arg(long, env = "CORSANYWHERE_REQUIRE_HEADER", value_delimiter = ',')]
    pub require_header: Vec<String>,

    #[arg(long, env = "CORSANYWHERE_MAX_REDIRECTS", default_value_t = 5)]
    pub max_redirects: u32,

    /// Access-Control-Max-Age for preflight replies, in seconds. Zero disables it.
    #[arg(long, env = "CORSANYWHERE_CORS_MAX_AGE", default_value_t = 0)]
    pub cors_max_age: u64,

    /// Request headers stripped before forwarding.
    #[arg(
        long = "remove-header",
        env = "CORSANYWHERE_REMOVE_HEADERS",
        value_delimiter = ',',
        default_values_t = DEFAULT_REMOVE_HEADERS.map(String::from)
    )]
    pub remove_headers: Vec<String>,

    /// Request headers injected before forwarding, as `name:value`.
    #[arg(long = "set-header", env = "CORSANYWHERE_SET_HEADERS", value_delimiter = ',')]
    pub set_headers: Vec<String>,

    /// Proxy same-origin requests instead of redirecting the caller to the target.
    #[arg(long, env = "CORSANYWHERE_NO_REDIRECT_SAME_ORIGIN")]
    pub no_redirect_same_origin: bool,

    #[arg(long, env = "TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    #[arg(long, env = "TLS_PORT", default_value_t = 8443)]
    pub tls_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            public_url: None,
            origin_blacklist: Vec::new(),
            origin_whitelist: Vec::new(),
            rate_limit: None,
            require_header: Vec::new(),
            max_redirects: 5,
            cors_max_age: 0,
            remove_headers: DEFAULT_REMOVE_HEADERS.map(String::from).to_vec(),
            set_headers: Vec::new(),
            no_redirect_same_origin: false,
            tls_cert: None,
            tls_key: None,
            tls_port: 8443,
        }
    }
}

impl Config {
    /// Drops empty list entries left over from empty environment variables.
    pub fn normalize(mut self) -> Self {
        let clean = |list: &mut Vec<String>, lowercase: bool| {
            list.retain(|entry| !entry.trim().is_empty());
            for entry in list.iter_mut() {
                *entry = entry.trim().to_string();
                if lowercase {
                    *entry = entry.to_ascii_lowercase();
                }
            }
        };
        clean(&mut self.origin_blacklist, false);
        clean(&mut self.origin_whitelist, false);
        clean(&mut self.require_header, true);
        clean(&mut self.remove_headers, true);
        clean(&mut self.set_headers, false);
        self.public_url = self.public_url.filter(|url| !url.trim().is_empty());
        self
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tls_addr(&self) -> String {
        format!("{}:{}", self.host, self.tls_port)
    }

    /// Base URL for links this proxy hands out, without a trailing slash.
    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    pub fn rate_limit_config(&self) -> Result<Option<RateLimitConfig>, ConfigError> {
        match &self.rate_limit {
            Some(setting) => RateLimitConfig::parse(setting),
            None => Ok(None),
        }
    }

    pub fn removed_headers(&self) -> Result<Vec<HeaderName>, ConfigError> {
        self.remove_headers
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| ConfigError::HeaderSetting(name.clone()))
            })
            .collect()
    }

    pub fn injected_headers(&self) -> Result<Vec<(HeaderName, HeaderValue)>, ConfigError> {
        self.set_headers
            .iter()
            .map(|setting| {
                let (name, value) = setting
                    .split_once(':')
                    .ok_or_else(|| ConfigError::HeaderSetting(setting.clone()))?;
                let name = HeaderName::from_bytes(name.trim().as_bytes())
                    .map_err(|_| ConfigError::HeaderSetting(setting.clone()))?;
                let value = HeaderValue::from_str(value.trim())
                    .map_err(|_| ConfigError::HeaderSetting(setting.clone()))?;
                Ok((name, value))
            })
            .collect()
    }
}
