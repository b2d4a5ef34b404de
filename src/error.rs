use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to proxy clients.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("The URL is invalid: two slashes are needed after the http(s):.")]
    MissingSlash,

    #[error("Port number too large: {0}")]
    PortTooLarge(String),

    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Missing required request header. Must specify one of: {0}")]
    HeaderRequired(String),

    #[error("The origin \"{0}\" was blacklisted by the operator of this proxy.")]
    OriginBlacklisted(String),

    #[error("The origin \"{0}\" was not whitelisted by the operator of this proxy.")]
    OriginNotWhitelisted(String),

    #[error("The origin \"{origin}\" has sent too many requests.\n{message}")]
    RateLimited { origin: String, message: String },

    #[error("URL parameter is required")]
    MissingUrl,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The `headers` query parameter was not a JSON object.
    #[error("{0}")]
    InvalidHeaders(String),

    /// Manifest fetch failed (transport error or upstream error status).
    #[error("{0}")]
    ManifestFetch(String),

    /// Segment upstream failed before any response header was written.
    #[error("Proxy error")]
    SegmentUpstream,

    /// Forwarded request failed before any response header was written.
    #[error("Not found because of proxy error: {0}")]
    Forward(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MissingSlash
            | ProxyError::PortTooLarge(_)
            | ProxyError::HeaderRequired(_)
            | ProxyError::MissingUrl => StatusCode::BAD_REQUEST,
            ProxyError::OriginBlacklisted(_) | ProxyError::OriginNotWhitelisted(_) => {
                StatusCode::FORBIDDEN
            }
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::InvalidHost(_) | ProxyError::Forward(_) => StatusCode::NOT_FOUND,
            ProxyError::InvalidUrl(_)
            | ProxyError::InvalidHeaders(_)
            | ProxyError::ManifestFetch(_)
            | ProxyError::SegmentUpstream => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, self.to_string()).into_response();
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        response
    }
}

/// JSON error envelope used by the media and general proxy endpoints.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unexpected() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "An unexpected error occurred.",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response =
            (self.status, axum::Json(json!({ "error": self.message }))).into_response();
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        response
    }
}

/// Startup configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid rate limit setting: {0}")]
    RateLimit(String),

    #[error("Invalid header setting {0:?}: expected name:value")]
    HeaderSetting(String),

    #[error("TLS material error: {0}")]
    Tls(String),

    #[error("Failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
