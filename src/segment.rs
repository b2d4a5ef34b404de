//! Segment and key streaming for rewritten playlists.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, Request, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use crate::error::ProxyError;
use crate::router::AppState;
use crate::upstream::{
    CallerHeaders, SEGMENT_USER_AGENT, relay_body, request_has_body, strip_hop_by_hop,
};

#[derive(Debug, Deserialize)]
pub struct SegmentQuery {
    pub url: Option<String>,
    pub headers: Option<String>,
}

/// `GET|HEAD /ts-proxy?url=..&headers=..`
///
/// The response is always labelled `video/mp2t`, whatever the upstream says.
pub async fn proxy_segment(
    State(state): State<AppState>,
    Query(query): Query<SegmentQuery>,
    req: Request<Body>,
) -> Response {
    let caller = match CallerHeaders::parse(query.headers.as_deref()) {
        Ok(headers) => headers,
        Err(e) => return e.into_response(),
    };
    let Some(raw) = query.url else {
        return ProxyError::MissingUrl.into_response();
    };
    let target = match Url::parse(&raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        Ok(url) => {
            return ProxyError::InvalidUrl(format!("unsupported scheme {}", url.scheme()))
                .into_response();
        }
        Err(e) => return ProxyError::InvalidUrl(e.to_string()).into_response(),
    };

    let mut upstream_headers = HeaderMap::new();
    upstream_headers.insert(header::USER_AGENT, HeaderValue::from_static(SEGMENT_USER_AGENT));
    for (name, value) in &caller.header_map() {
        upstream_headers.insert(name.clone(), value.clone());
    }

    let (parts, body) = req.into_parts();
    debug!(method = %parts.method, url = %target, "Fetching segment");

    let mut request = state
        .upstream
        .forward
        .request(parts.method.clone(), target.clone())
        .headers(upstream_headers);
    if request_has_body(&parts.headers) {
        request = request.body(reqwest::Body::wrap_stream(body));
    }

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            error!(method = %parts.method, url = %target, error = %e, phase = "connect", "Segment request failed");
            return ProxyError::SegmentUpstream.into_response();
        }
    };

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

    let mut response = Response::new(relay_body(upstream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
