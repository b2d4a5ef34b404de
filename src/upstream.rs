//! Upstream HTTP clients and per-destination proxy selection.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::BoxBody;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use futures_util::TryStreamExt;
use hyper::Body;
use reqwest::{Client, Proxy, redirect};
use serde_json::{Map, Value};
use tracing::warn;
use url::Url;

use crate::error::ProxyError;

/// User-Agent sent to segment hosts unless the caller overrides it.
pub const SEGMENT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/80.0.3987.132 Safari/537.36";

/// User-Agent sent by the media and general proxies.
pub const MEDIA_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes connection-scoped headers that must not cross the proxy,
/// including any the `Connection` header itself names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// True when an inbound request announces a body worth piping upstream.
pub fn request_has_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .is_some_and(|len| len > 0)
}

/// Streams an upstream body to the client chunk by chunk.
///
/// Errors after the headers were sent end the stream and are only logged.
pub fn relay_body(response: reqwest::Response) -> BoxBody {
    let target = response.url().to_string();
    let stream = response
        .bytes_stream()
        .inspect_err(move |e| {
            warn!(url = %target, error = %e, phase = "stream", "Upstream body interrupted")
        })
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    axum::body::boxed(Body::wrap_stream(stream))
}

/// Chooses an outbound proxy for a destination URL.
pub trait ProxySelector: Send + Sync + fmt::Debug {
    fn proxy_for(&self, url: &Url) -> Option<Url>;
}

/// Never routes through a proxy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn proxy_for(&self, _url: &Url) -> Option<Url> {
        None
    }
}

/// Proxy selection from `HTTP_PROXY`, `HTTPS_PROXY`, `ALL_PROXY` and `NO_PROXY`.
#[derive(Debug, Default, Clone)]
pub struct EnvProxySelector {
    http: Option<Url>,
    https: Option<Url>,
    all: Option<Url>,
    no_proxy: Vec<String>,
}

impl EnvProxySelector {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a selector from an arbitrary variable lookup. Lower-case names win.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            lookup(&name.to_ascii_lowercase())
                .or_else(|| lookup(name))
                .filter(|v| !v.trim().is_empty())
        };
        let proxy_url = |name: &str| {
            var(name).and_then(|raw| {
                let raw = if raw.contains("://") {
                    raw
                } else {
                    format!("http://{raw}")
                };
                Url::parse(&raw)
                    .map_err(|e| warn!(variable = name, error = %e, "Ignoring invalid proxy URL"))
                    .ok()
            })
        };

        Self {
            http: proxy_url("HTTP_PROXY"),
            https: proxy_url("HTTPS_PROXY"),
            all: proxy_url("ALL_PROXY"),
            no_proxy: var("NO_PROXY")
                .map(|list| {
                    list.split([',', ' '])
                        .map(|entry| entry.trim().to_ascii_lowercase())
                        .filter(|entry| !entry.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    fn bypassed(&self, url: &Url) -> bool {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let port = url.port_or_known_default();
        self.no_proxy.iter().any(|entry| {
            if entry == "*" {
                return true;
            }
            let (entry_host, entry_port) = match entry.rsplit_once(':') {
                Some((h, p)) if p.bytes().all(|b| b.is_ascii_digit()) => (h, p.parse().ok()),
                _ => (entry.as_str(), None),
            };
            if entry_port.is_some() && entry_port != port {
                return false;
            }
            let entry_host = entry_host.trim_start_matches('*').trim_start_matches('.');
            host == entry_host || host.ends_with(&format!(".{entry_host}"))
        })
    }
}

impl ProxySelector for EnvProxySelector {
    fn proxy_for(&self, url: &Url) -> Option<Url> {
        if self.bypassed(url) {
            return None;
        }
        let specific = match url.scheme() {
            "https" => self.https.clone(),
            "http" => self.http.clone(),
            _ => None,
        };
        specific.or_else(|| self.all.clone())
    }
}

/// Fetch behaviour for the media and general proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Direct,
    /// Presents a full desktop-browser header profile to hosts that filter bots.
    Browser,
}

impl FetchStrategy {
    pub fn from_flag(enabled: bool) -> Self {
        if enabled {
            FetchStrategy::Browser
        } else {
            FetchStrategy::Direct
        }
    }
}

/// Clients shared by all request handlers.
#[derive(Debug, Clone)]
pub struct Upstream {
    /// Never follows redirects.
    pub forward: Client,
    /// Follows redirects; used for manifests, media and buffered requests.
    pub fetch: Client,
    browser: Client,
    selector: Arc<dyn ProxySelector>,
}

impl Upstream {
    /// Every client routes through `selector`, which also turns off reqwest's
    /// own environment proxy detection.
    pub fn new(selector: Arc<dyn ProxySelector>) -> Result<Self, reqwest::Error> {
        let routed = || {
            let hook = selector.clone();
            Client::builder()
                .proxy(Proxy::custom(move |url| hook.proxy_for(url)))
                .connect_timeout(Duration::from_secs(10))
                .pool_idle_timeout(Duration::from_secs(90))
        };

        let forward = routed().redirect(redirect::Policy::none()).build()?;
        let fetch = routed().build()?;
        let browser = routed().default_headers(browser_profile()).build()?;

        Ok(Self {
            forward,
            fetch,
            browser,
            selector,
        })
    }

    pub fn client(&self, strategy: FetchStrategy) -> &Client {
        match strategy {
            FetchStrategy::Direct => &self.fetch,
            FetchStrategy::Browser => &self.browser,
        }
    }

    pub fn selector(&self) -> &Arc<dyn ProxySelector> {
        &self.selector
    }
}

fn browser_profile() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(MEDIA_USER_AGENT));
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static("\" Not;A Brand\";v=\"99\", \"Google Chrome\";v=\"91\", \"Chromium\";v=\"91\""),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers.insert("sec-fetch-site", HeaderValue::from_static("cross-site"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("no-cors"));
    headers
}

/// Upstream headers supplied by the caller as a JSON object.
///
/// Kept as the original JSON so that rewritten links carry it verbatim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallerHeaders(Map<String, Value>);

impl CallerHeaders {
    /// Parses the `headers` parameter; an absent parameter means `{}`.
    pub fn parse(raw: Option<&str>) -> Result<Self, ProxyError> {
        let raw = raw.unwrap_or("{}");
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(ProxyError::InvalidHeaders(format!(
                "headers must be a JSON object, got {other}"
            ))),
            Err(e) => Err(ProxyError::InvalidHeaders(e.to_string())),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    /// Converts to request headers, skipping names or values HTTP cannot carry.
    pub fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.0 {
            let text = match value {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&text),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping caller header that is not valid HTTP"),
            }
        }
        headers
    }
}
