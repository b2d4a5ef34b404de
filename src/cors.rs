//! CORS response header synthesis.

use axum::http::{HeaderMap, HeaderValue, Method, header};

/// CORS fields taken from an inbound request.
///
/// Taking them removes the `Access-Control-Request-*` headers from the
/// request so they are never forwarded upstream.
#[derive(Debug, Clone, Default)]
pub struct CorsRequest {
    preflight: bool,
    max_age: u64,
    request_method: Option<HeaderValue>,
    request_headers: Option<HeaderValue>,
}

impl CorsRequest {
    pub fn take(method: &Method, headers: &mut HeaderMap, max_age: u64) -> Self {
        Self {
            preflight: method == Method::OPTIONS,
            max_age,
            request_method: headers.remove(header::ACCESS_CONTROL_REQUEST_METHOD),
            request_headers: headers.remove(header::ACCESS_CONTROL_REQUEST_HEADERS),
        }
    }

    /// Adds the CORS headers to `headers` and exposes every header name.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        if self.preflight && self.max_age > 0 {
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.max_age));
        }
        if let Some(method) = &self.request_method {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, method.clone());
        }
        if let Some(names) = &self.request_headers {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, names.clone());
        }

        headers.remove(header::ACCESS_CONTROL_EXPOSE_HEADERS);
        let exposed = headers
            .keys()
            .map(|name| name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        if let Ok(value) = HeaderValue::from_str(&exposed) {
            headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
        }
    }

    /// Header set for responses generated by the proxy itself.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.apply(&mut headers);
        headers
    }
}
