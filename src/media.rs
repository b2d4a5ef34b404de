//! Range-aware progressive media proxy.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::ApiError;
use crate::router::AppState;
use crate::upstream::{FetchStrategy, MEDIA_USER_AGENT, relay_body};

const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const GET_TIMEOUT: Duration = Duration::from_secs(30);

const PASS_THROUGH: [header::HeaderName; 7] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
    header::LAST_MODIFIED,
    header::ETAG,
    header::CACHE_CONTROL,
];

#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    pub url: Option<String>,
    pub referer: Option<String>,
    pub cf: Option<String>,
    pub cache: Option<String>,
}

fn flag(value: &Option<String>) -> bool {
    value.as_deref() == Some("true")
}

fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range, Content-Type, Authorization"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Length, Content-Range, Accept-Ranges"),
    );
    headers
}

/// `OPTIONS /api/video-proxy`
pub async fn media_preflight() -> Response {
    let mut headers = cors_headers();
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    (StatusCode::OK, headers).into_response()
}

/// `GET|HEAD /api/video-proxy?url=..&referer=..&cf=..&cache=..`
pub async fn proxy_media(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<MediaQuery>,
    client_headers: HeaderMap,
) -> Response {
    let Some(raw) = query.url.as_deref() else {
        let mut response =
            (StatusCode::BAD_REQUEST, "URL parameter is required").into_response();
        response
            .headers_mut()
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        return response;
    };
    let target = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => {
            error!(url = raw, error = %e, "Invalid media URL");
            return ApiError::unexpected().into_response();
        }
    };

    let head = method == Method::HEAD;
    let range = client_headers.get(header::RANGE).cloned();
    let strategy = FetchStrategy::from_flag(flag(&query.cf));

    let mut upstream_headers = HeaderMap::new();
    upstream_headers.insert(header::USER_AGENT, HeaderValue::from_static(MEDIA_USER_AGENT));
    upstream_headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    if !head {
        upstream_headers.insert("sec-fetch-dest", HeaderValue::from_static("video"));
        if let Some(range) = &range {
            upstream_headers.insert(header::RANGE, range.clone());
        }
    }
    if let Some(referer) = query.referer.as_deref() {
        match HeaderValue::from_str(referer) {
            Ok(value) => {
                upstream_headers.insert(header::REFERER, value);
            }
            Err(_) => warn!(referer, "Ignoring referer that is not a valid header value"),
        }
    }

    let (upstream_method, timeout) = if head {
        (Method::HEAD, HEAD_TIMEOUT)
    } else {
        (Method::GET, GET_TIMEOUT)
    };
    info!(method = %upstream_method, url = %target, ?strategy, range = ?range, "Fetching media");

    let send = state
        .upstream
        .client(strategy)
        .request(upstream_method, target.clone())
        .headers(upstream_headers)
        .send();
    let upstream = match tokio::time::timeout(timeout, send).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(url = %target, error = %e, phase = "connect", "Media request failed");
            return ApiError::unexpected().into_response();
        }
        Err(_) => {
            error!(url = %target, timeout_secs = timeout.as_secs(), phase = "headers", "Media request timed out");
            return ApiError::unexpected().into_response();
        }
    };

    let upstream_status = upstream.status();
    if upstream_status.as_u16() >= 400 {
        warn!(url = %target, status = upstream_status.as_u16(), "Media upstream returned an error");
        return ApiError::new(
            upstream_status,
            format!("Upstream server returned {}", upstream_status.as_u16()),
        )
        .into_response();
    }

    let mut headers = cors_headers();
    for name in PASS_THROUGH {
        if let Some(value) = upstream.headers().get(&name) {
            headers.insert(name, value.clone());
        }
    }
    if !headers.contains_key(header::ACCEPT_RANGES) {
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    if flag(&query.cache) {
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=3600, stale-while-revalidate=86400"),
        );
        headers.insert(header::VARY, HeaderValue::from_static("Range"));
    } else {
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
    }

    if head {
        return (StatusCode::OK, headers).into_response();
    }

    let status = if range.is_some() && upstream_status == StatusCode::PARTIAL_CONTENT {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    debug!(url = %target, status = status.as_u16(), "Streaming media body");

    let mut response = Response::new(relay_body(upstream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
