//! Buffered request relay driven by a JSON description.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::error::ApiError;
use crate::router::AppState;
use crate::upstream::{CallerHeaders, FetchStrategy, MEDIA_USER_AGENT};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Request description posted by the caller.
///
/// Fields are loosely typed: wrong-typed values fall back to their defaults
/// instead of failing the whole body.
#[derive(Debug, Default, Deserialize)]
pub struct RelayRequest {
    pub url: Option<Value>,
    pub method: Option<Value>,
    pub headers: Option<Value>,
    pub form_data: Option<Value>,
    /// Seconds, as a number or numeric string.
    pub timeout: Option<Value>,
    pub cf: Option<Value>,
}

impl RelayRequest {
    /// Parses a request body. An empty body is an empty description and any
    /// JSON value other than an object describes nothing.
    pub fn from_body(body: &[u8]) -> Result<Self, serde_json::Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        match serde_json::from_slice::<Value>(body)? {
            value @ Value::Object(_) => serde_json::from_value(value),
            _ => Ok(Self::default()),
        }
    }

    fn url(&self) -> Option<&str> {
        self.url
            .as_ref()
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
    }

    /// `None` when the method is neither GET nor POST.
    fn method(&self) -> Option<Method> {
        match &self.method {
            None | Some(Value::Null) => Some(Method::GET),
            Some(Value::String(m)) if m.is_empty() => Some(Method::GET),
            Some(Value::String(m)) => match m.to_ascii_uppercase().as_str() {
                "GET" => Some(Method::GET),
                "POST" => Some(Method::POST),
                _ => None,
            },
            Some(_) => None,
        }
    }

    fn headers(&self) -> Map<String, Value> {
        match &self.headers {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    fn cf(&self) -> bool {
        match &self.cf {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(flag)) => flag == "true",
            _ => false,
        }
    }

    fn timeout(&self) -> Duration {
        let secs = match &self.timeout {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match secs {
            Some(secs) if secs.is_finite() && secs > 0.0 => Duration::from_secs_f64(secs),
            _ => DEFAULT_TIMEOUT,
        }
    }
}

fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers
}

/// `OPTIONS /api/proxy`
pub async fn relay_preflight() -> Response {
    let mut headers = cors_headers();
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    (StatusCode::OK, headers).into_response()
}

/// `POST /api/proxy`
pub async fn proxy_relay(State(state): State<AppState>, body: Bytes) -> Response {
    let relay = match RelayRequest::from_body(&body) {
        Ok(relay) => relay,
        Err(e) => {
            error!(error = %e, "Rejecting relay request body");
            return ApiError::bad_request("Invalid JSON in request body").into_response();
        }
    };
    let Some(url) = relay.url() else {
        return ApiError::bad_request("URL is required").into_response();
    };
    let Some(method) = relay.method() else {
        return ApiError::bad_request("Only GET and POST methods are allowed").into_response();
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(MEDIA_USER_AGENT));
    for (name, value) in &CallerHeaders::from_map(relay.headers()).header_map() {
        headers.insert(name.clone(), value.clone());
    }

    let client = state.upstream.client(FetchStrategy::from_flag(relay.cf()));
    let mut request = client
        .request(method.clone(), url)
        .headers(headers)
        .timeout(relay.timeout());

    if method == Method::POST {
        request = match &relay.form_data {
            Some(Value::Object(fields)) => {
                let form: Vec<(String, String)> = fields
                    .iter()
                    .map(|(k, v)| {
                        let v = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), v)
                    })
                    .collect();
                request.form(&form)
            }
            Some(Value::String(raw)) => request.body(raw.clone()),
            _ => request,
        };
    }

    info!(method = %method, url, timeout_secs = relay.timeout().as_secs_f64(), "Relaying request");

    let result = async {
        let response = request.send().await?;
        let status = response.status();
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let bytes = response.bytes().await?;
        Ok::<_, reqwest::Error>((status, content_type, bytes))
    }
    .await;

    match result {
        Ok((status, content_type, bytes)) => {
            let mut headers = cors_headers();
            headers.insert(
                header::CONTENT_TYPE,
                content_type
                    .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream")),
            );
            (status, headers, bytes).into_response()
        }
        Err(e) => {
            error!(url, error = %e, "Relay request failed");
            ApiError::unexpected().into_response()
        }
    }
}
