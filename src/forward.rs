//! CORS-bypass forwarding with internal redirect resolution.
//!
//! A request enters as `/<target>`, passes the origin policy and is sent
//! upstream. 301/302/303 responses are followed here, up to the configured
//! limit, and every other response is streamed back with CORS headers
//! attached.

use std::sync::Arc;

use axum::{
    Extension,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::cors::CorsRequest;
use crate::error::{ConfigError, ProxyError};
use crate::location::{Location, LocationError};
use crate::rate_limit::RateLimiter;
use crate::router::{AppState, INDEX_HTML};
use crate::tls::TlsConnection;
use crate::upstream::{ProxySelector, relay_body, request_has_body, strip_hop_by_hop};
use crate::validate::is_valid_host;

static MISSING_SLASH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^/https?:/[^/]").expect("static regex"));
static EXPLICIT_SCHEME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^/https?:").expect("static regex"));

/// Operator policy applied to every forwarded request.
#[derive(Debug, Clone)]
pub struct ForwardPolicy {
    pub origin_blacklist: Vec<String>,
    pub origin_whitelist: Vec<String>,
    pub require_header: Vec<HeaderName>,
    pub remove_headers: Vec<HeaderName>,
    pub set_headers: Vec<(HeaderName, HeaderValue)>,
    pub max_redirects: u32,
    pub cors_max_age: u64,
    pub redirect_same_origin: bool,
}

impl ForwardPolicy {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let require_header = config
            .require_header
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| ConfigError::HeaderSetting(name.clone()))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            origin_blacklist: config.origin_blacklist.clone(),
            origin_whitelist: config.origin_whitelist.clone(),
            require_header,
            remove_headers: config.removed_headers()?,
            set_headers: config.injected_headers()?,
            max_redirects: config.max_redirects,
            cors_max_age: config.cors_max_age,
            redirect_same_origin: !config.no_redirect_same_origin,
        })
    }

    /// Runs the origin checks in order, returning the first rejection.
    pub fn check(
        &self,
        origin: &str,
        headers: &HeaderMap,
        limiter: Option<&RateLimiter>,
    ) -> Result<(), ProxyError> {
        if self.origin_blacklist.iter().any(|o| o == origin) {
            return Err(ProxyError::OriginBlacklisted(origin.to_string()));
        }
        if !self.origin_whitelist.is_empty() && !self.origin_whitelist.iter().any(|o| o == origin)
        {
            return Err(ProxyError::OriginNotWhitelisted(origin.to_string()));
        }
        if !self.require_header.is_empty()
            && !self.require_header.iter().any(|name| headers.contains_key(name))
        {
            let names = self
                .require_header
                .iter()
                .map(HeaderName::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ProxyError::HeaderRequired(names));
        }
        if let Some(message) = limiter.and_then(|limiter| limiter.check(origin)) {
            return Err(ProxyError::RateLimited {
                origin: origin.to_string(),
                message,
            });
        }
        Ok(())
    }

    /// Prepares client headers for the upstream request.
    pub fn rewrite_headers(&self, headers: &mut HeaderMap) {
        strip_hop_by_hop(headers);
        headers.remove(header::HOST);
        for name in &self.remove_headers {
            headers.remove(name);
        }
        for (name, value) in &self.set_headers {
            headers.insert(name.clone(), value.clone());
        }
    }
}

/// State of one client request across all hops it resolves internally.
#[derive(Debug)]
pub struct ProxyRequestState {
    location: Location,
    redirect_count: u32,
    max_redirects: u32,
    selector: Arc<dyn ProxySelector>,
    proxy_base_url: String,
}

/// What the response hook decided for one upstream response.
#[derive(Debug, PartialEq, Eq)]
pub enum HopOutcome {
    /// Abandon this response and request `next` with GET.
    Follow { status: StatusCode, next: Location },
    /// Hand the response to the client, optionally with a rewritten `Location`.
    Relay { location: Option<String> },
}

impl ProxyRequestState {
    pub fn new(
        location: Location,
        max_redirects: u32,
        selector: Arc<dyn ProxySelector>,
        proxy_base_url: String,
    ) -> Self {
        Self {
            location,
            redirect_count: 0,
            max_redirects,
            selector,
            proxy_base_url,
        }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn redirect_count(&self) -> u32 {
        self.redirect_count
    }

    /// Classifies a response by status and `Location` header.
    pub fn on_response(&mut self, status: StatusCode, location: Option<&str>) -> HopOutcome {
        let redirect = matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308);
        let next = match location {
            Some(raw) if redirect => self.location.resolve(raw),
            _ => None,
        };
        let Some(next) = next else {
            return HopOutcome::Relay { location: None };
        };

        if matches!(status.as_u16(), 301 | 302 | 303) {
            if self.redirect_count < self.max_redirects {
                self.redirect_count += 1;
                return HopOutcome::Follow { status, next };
            }
            warn!(
                url = %self.location,
                redirect_count = self.redirect_count,
                "Redirect limit reached, relaying redirect to client"
            );
        }
        HopOutcome::Relay {
            location: Some(format!("{}/{}", self.proxy_base_url, next.href())),
        }
    }

    /// Moves to the redirect target.
    pub fn advance(&mut self, next: Location) {
        self.location = next;
    }
}

/// Fallback handler: everything not served by a named route.
pub async fn forward(
    State(state): State<AppState>,
    tls: Option<Extension<TlsConnection>>,
    req: Request<Body>,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let policy = &state.policy;
    let cors = CorsRequest::take(&parts.method, &mut parts.headers, policy.cors_max_age);

    if parts.method == Method::OPTIONS {
        return (StatusCode::OK, cors.headers()).into_response();
    }

    let raw = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let tail = raw.strip_prefix('/').unwrap_or(&raw);

    let location = match Location::parse(tail) {
        Ok(location) => location,
        Err(LocationError::PortTooLarge(port)) => {
            return reject(ProxyError::PortTooLarge(port), &cors);
        }
        Err(LocationError::Invalid) => {
            if MISSING_SLASH_RE.is_match(&raw) {
                return reject(ProxyError::MissingSlash, &cors);
            }
            return Html(INDEX_HTML).into_response();
        }
    };

    if location.hostname() == "iscorsneeded" {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            "no",
        )
            .into_response();
    }

    let explicit_scheme = EXPLICIT_SCHEME_RE.is_match(&raw);
    if !explicit_scheme && !is_valid_host(location.hostname()) {
        return reject(ProxyError::InvalidHost(location.hostname().to_string()), &cors);
    }

    let origin = parts
        .headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    info!(method = %parts.method, url = %location, origin = %origin, "Forwarding request");

    if let Err(e) = policy.check(&origin, &parts.headers, state.rate_limiter.as_deref()) {
        return reject(e, &cors);
    }

    if policy.redirect_same_origin && is_same_origin(&origin, location.href()) {
        debug!(url = %location, origin = %origin, "Redirecting same-origin request");
        let mut headers = cors.headers();
        headers.insert(header::VARY, HeaderValue::from_static("origin"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
        if let Ok(target) = HeaderValue::from_str(location.href()) {
            headers.insert(header::LOCATION, target);
        }
        return (StatusCode::MOVED_PERMANENTLY, headers).into_response();
    }

    let proxy_base_url = proxy_base(&parts.headers, tls.is_some(), &state.config);
    policy.rewrite_headers(&mut parts.headers);

    let request_state = ProxyRequestState::new(
        location,
        policy.max_redirects,
        state.upstream.selector().clone(),
        proxy_base_url,
    );
    run(&state, request_state, parts.method, parts.headers, body, &cors).await
}

async fn run(
    state: &AppState,
    mut request_state: ProxyRequestState,
    mut method: Method,
    mut headers: HeaderMap,
    body: Body,
    cors: &CorsRequest,
) -> Response {
    let has_body = request_has_body(&headers) && method != Method::GET && method != Method::HEAD;
    let mut body = has_body.then_some(body);
    if !has_body {
        headers.remove(header::CONTENT_LENGTH);
    }

    let mut trail = HeaderMap::new();
    if let Ok(first) = HeaderValue::from_str(request_state.location().href()) {
        trail.insert("x-request-url", first);
    }

    loop {
        let target = request_state.location().url().clone();
        debug!(
            method = %method,
            url = %target,
            scheme = request_state.location().scheme(),
            port = ?request_state.location().port(),
            redirect_count = request_state.redirect_count(),
            via = ?request_state.selector.proxy_for(&target),
            "Sending upstream request"
        );

        let mut request = state
            .upstream
            .forward
            .request(method.clone(), target.clone())
            .headers(headers.clone());
        if let Some(body) = body.take() {
            request = request.body(reqwest::Body::wrap_stream(body));
        }

        let upstream = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!(method = %method, url = %target, error = %e, phase = "connect", "Upstream request failed");
                return ProxyError::Forward(e.to_string()).into_response();
            }
        };

        let status = upstream.status();
        let redirect_to = upstream
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match request_state.on_response(status, redirect_to.as_deref()) {
            HopOutcome::Follow { status, next } => {
                let n = request_state.redirect_count();
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(format!("x-cors-redirect-{n}").as_bytes()),
                    HeaderValue::from_str(&format!("{} {}", status.as_u16(), next.href())),
                ) {
                    trail.insert(name, value);
                }
                debug!(
                    status = status.as_u16(),
                    url = %target,
                    next = %next,
                    redirect_count = n,
                    "Abandoning redirect response"
                );
                drop(upstream);

                method = Method::GET;
                headers.remove(header::CONTENT_TYPE);
                headers.remove(header::CONTENT_LENGTH);
                request_state.advance(next);
            }
            HopOutcome::Relay { location } => {
                return relay(&request_state, upstream, location, trail, cors);
            }
        }
    }
}

fn relay(
    request_state: &ProxyRequestState,
    upstream: reqwest::Response,
    location: Option<String>,
    trail: HeaderMap,
    cors: &CorsRequest,
) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::SET_COOKIE);
    headers.remove("set-cookie2");

    if let Some(value) = location.and_then(|l| HeaderValue::from_str(&l).ok()) {
        headers.insert(header::LOCATION, value);
    }
    if let Ok(value) = HeaderValue::from_str(request_state.location().href()) {
        headers.insert("x-final-url", value);
    }
    for (name, value) in &trail {
        headers.insert(name.clone(), value.clone());
    }
    cors.apply(&mut headers);

    debug!(status = status.as_u16(), url = %request_state.location(), "Relaying upstream response");

    let mut response = Response::new(relay_body(upstream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Renders a rejection with the full CORS header set.
fn reject(err: ProxyError, cors: &CorsRequest) -> Response {
    warn!(status = err.status_code().as_u16(), reason = %err, "Rejecting request");
    let mut response = err.into_response();
    cors.apply(response.headers_mut());
    response
}

fn is_same_origin(origin: &str, href: &str) -> bool {
    !origin.is_empty()
        && href
            .strip_prefix(origin)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Base URL of this proxy as the client addressed it.
fn proxy_base(headers: &HeaderMap, tls: bool, config: &Config) -> String {
    let forwarded_https = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.trim_start().starts_with("https"));
    let scheme = if tls || forwarded_https { "https" } else { "http" };

    match headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        Some(host) => format!("{scheme}://{host}"),
        None => config.public_url(),
    }
}
