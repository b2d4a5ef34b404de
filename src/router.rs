use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::ConfigError;
use crate::forward::{self, ForwardPolicy};
use crate::general;
use crate::hls;
use crate::media;
use crate::rate_limit::RateLimiter;
use crate::segment;
use crate::upstream::{EnvProxySelector, ProxySelector, Upstream};

pub const INDEX_HTML: &str = include_str!("../static/index.html");

/// Shared handler state. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub policy: Arc<ForwardPolicy>,
    pub upstream: Upstream,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

impl AppState {
    /// Builds state with outbound proxies taken from the environment.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        Self::with_selector(config, Arc::new(EnvProxySelector::from_env()))
    }

    pub fn with_selector(
        config: Config,
        selector: Arc<dyn ProxySelector>,
    ) -> Result<Self, ConfigError> {
        let policy = ForwardPolicy::from_config(&config)?;
        let rate_limiter = config
            .rate_limit_config()?
            .map(|limit| Arc::new(RateLimiter::new(limit)));
        let upstream = Upstream::new(selector)?;

        Ok(Self {
            config: Arc::new(config),
            policy: Arc::new(policy),
            upstream,
            rate_limiter,
        })
    }

    /// Starts the rate limit window timer, if a limit is configured.
    pub fn spawn_background_tasks(&self) {
        if let Some(limiter) = &self.rate_limiter {
            let limit = limiter.config();
            info!(
                max_requests = limit.max_requests,
                period_minutes = limit.period_minutes,
                "Rate limiting enabled"
            );
            limiter.spawn_reset();
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/m3u8-proxy",
            get(hls::proxy_manifest).options(playlist_preflight),
        )
        .route(
            "/ts-proxy",
            get(segment::proxy_segment).options(playlist_preflight),
        )
        .route(
            "/api/video-proxy",
            get(media::proxy_media).options(media::media_preflight),
        )
        .route(
            "/api/proxy",
            post(general::proxy_relay).options(general::relay_preflight),
        )
        .fallback(forward::forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn playlist_preflight() -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    for name in [
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        header::ACCESS_CONTROL_ALLOW_METHODS,
    ] {
        headers.insert(name, HeaderValue::from_static("*"));
    }
    response
}
