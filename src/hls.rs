//! HLS manifest rewriting.
//!
//! Every URI in a fetched playlist is replaced by a link back into this
//! proxy, carrying the caller's upstream headers as a query parameter.
//! Variant playlists of a master are linked through `/m3u8-proxy`; segments
//! and encryption keys go through `/ts-proxy`.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::ProxyError;
use crate::router::AppState;
use crate::upstream::CallerHeaders;

/// Upper bound for fetching a manifest, body included.
pub const MANIFEST_TIMEOUT: Duration = Duration::from_secs(100);

static KEY_URI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^"\s]+"#).expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    /// Lists variant streams.
    Master,
    /// Lists segments of a single variant.
    Media,
}

impl PlaylistKind {
    pub fn classify(manifest: &str) -> Self {
        if manifest.contains("RESOLUTION=") {
            PlaylistKind::Master
        } else {
            PlaylistKind::Media
        }
    }

    fn uri_endpoint(self) -> &'static str {
        match self {
            PlaylistKind::Master => "m3u8-proxy",
            PlaylistKind::Media => "ts-proxy",
        }
    }
}

/// Everything needed to rewrite one manifest.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    pub manifest_url: Url,
    pub headers: CallerHeaders,
    pub public_base: String,
}

impl RewriteContext {
    pub fn new(manifest_url: Url, headers: CallerHeaders, public_base: &str) -> Self {
        Self {
            manifest_url,
            headers,
            public_base: public_base.trim_end_matches('/').to_string(),
        }
    }

    /// Builds `<base>/<endpoint>?url=<target>&headers=<json>`.
    pub fn link(&self, endpoint: &str, target: &str) -> String {
        format!(
            "{}/{}?url={}&headers={}",
            self.public_base,
            endpoint,
            urlencoding::encode(target),
            urlencoding::encode(&self.headers.to_json())
        )
    }

    /// Rewrites a manifest line by line, preserving line order.
    pub fn rewrite(&self, manifest: &str) -> String {
        let kind = PlaylistKind::classify(manifest);
        manifest
            .split('\n')
            .map(|line| self.rewrite_line(line, kind))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn rewrite_line(&self, line: &str, kind: PlaylistKind) -> String {
        if line.starts_with("#EXT-X-KEY:") {
            return match KEY_URI_RE.find(line) {
                Some(uri) => {
                    let link = self.link("ts-proxy", uri.as_str());
                    format!("{}{}{}", &line[..uri.start()], link, &line[uri.end()..])
                }
                None => line.to_string(),
            };
        }
        if line.starts_with('#') || line.trim().is_empty() {
            return line.to_string();
        }

        match self.manifest_url.join(line.trim()) {
            Ok(resolved) => self.link(kind.uri_endpoint(), resolved.as_str()),
            Err(e) => {
                warn!(line, error = %e, "Leaving unresolvable playlist URI untouched");
                line.to_string()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ManifestQuery {
    pub url: Option<String>,
    pub headers: Option<String>,
}

/// `GET /m3u8-proxy?url=..&headers=..`
pub async fn proxy_manifest(
    State(state): State<AppState>,
    Query(query): Query<ManifestQuery>,
) -> Response {
    match fetch_and_rewrite(&state, query).await {
        Ok(body) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/vnd.apple.mpegurl"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("*"),
            );
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("*"),
            );
            (StatusCode::OK, headers, body).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn fetch_and_rewrite(state: &AppState, query: ManifestQuery) -> Result<String, ProxyError> {
    let headers = CallerHeaders::parse(query.headers.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to parse manifest headers parameter");
        e
    })?;
    let url = query.url.ok_or(ProxyError::MissingUrl)?;
    let manifest_url =
        Url::parse(&url).map_err(|e| ProxyError::ManifestFetch(format!("Invalid URL: {e}")))?;

    info!(url = %manifest_url, "Fetching manifest");
    let manifest = state
        .upstream
        .fetch
        .get(manifest_url.clone())
        .headers(headers.header_map())
        .timeout(MANIFEST_TIMEOUT)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| {
            error!(url = %manifest_url, error = %e, phase = "fetch", "Failed to fetch manifest");
            ProxyError::ManifestFetch(e.to_string())
        })?
        .text()
        .await
        .map_err(|e| {
            error!(url = %manifest_url, error = %e, phase = "read", "Failed to read manifest");
            ProxyError::ManifestFetch(e.to_string())
        })?;

    let kind = PlaylistKind::classify(&manifest);
    debug!(?kind, bytes = manifest.len(), "Rewriting manifest");
    let ctx = RewriteContext::new(manifest_url, headers, &state.config.public_url());
    Ok(ctx.rewrite(&manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(manifest: &str) -> RewriteContext {
        let headers = match json!({"Referer": "https://player.example/"}) {
            serde_json::Value::Object(map) => CallerHeaders::from_map(map),
            _ => unreachable!(),
        };
        RewriteContext::new(
            Url::parse(manifest).unwrap(),
            headers,
            "http://proxy.local:8081/",
        )
    }

    fn encoded_headers() -> String {
        urlencoding::encode(r#"{"Referer":"https://player.example/"}"#).into_owned()
    }

    #[test]
    fn classifies_by_resolution_attribute() {
        assert_eq!(
            PlaylistKind::classify("#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=1280x720\n720p.m3u8"),
            PlaylistKind::Master
        );
        assert_eq!(
            PlaylistKind::classify("#EXTM3U\n#EXTINF:10,\nseg0.ts"),
            PlaylistKind::Media
        );
    }

    #[test]
    fn master_variants_route_through_manifest_proxy() {
        let manifest = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720\n720p.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\nhttps://other.example/360p.m3u8";
        let out = ctx("https://cdn.example.com/hls/master.m3u8").rewrite(manifest);
        let lines: Vec<&str> = out.split('\n').collect();

        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(
            lines[1],
            "#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720"
        );
        assert_eq!(
            lines[2],
            format!(
                "http://proxy.local:8081/m3u8-proxy?url={}&headers={}",
                urlencoding::encode("https://cdn.example.com/hls/720p.m3u8"),
                encoded_headers()
            )
        );
        assert!(lines[4].starts_with("http://proxy.local:8081/m3u8-proxy?url=https%3A%2F%2Fother.example%2F360p.m3u8&"));
    }

    #[test]
    fn media_segments_route_through_segment_proxy() {
        let manifest = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10,\nseg0.ts\n#EXTINF:10,\n../seg1.ts\n#EXT-X-ENDLIST\n";
        let out = ctx("https://cdn.example.com/hls/720p/index.m3u8").rewrite(manifest);
        let lines: Vec<&str> = out.split('\n').collect();

        assert_eq!(
            lines[3],
            format!(
                "http://proxy.local:8081/ts-proxy?url={}&headers={}",
                urlencoding::encode("https://cdn.example.com/hls/720p/seg0.ts"),
                encoded_headers()
            )
        );
        assert!(lines[5].contains(&*urlencoding::encode("https://cdn.example.com/hls/seg1.ts")));
        assert_eq!(lines[6], "#EXT-X-ENDLIST");
        // Trailing newline is preserved, not turned into a link.
        assert_eq!(lines[7], "");
    }

    #[test]
    fn key_uri_is_rewritten_in_place() {
        let manifest = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/k1.bin\",IV=0x1234\n#EXTINF:10,\nseg0.ts";
        let out = ctx("https://cdn.example.com/a/index.m3u8").rewrite(manifest);
        let key_line = out.split('\n').nth(1).unwrap();

        let expected_link = format!(
            "http://proxy.local:8081/ts-proxy?url={}&headers={}",
            urlencoding::encode("https://keys.example.com/k1.bin"),
            encoded_headers()
        );
        assert_eq!(
            key_line,
            format!("#EXT-X-KEY:METHOD=AES-128,URI=\"{expected_link}\",IV=0x1234")
        );
    }

    #[test]
    fn headers_parameter_round_trips() {
        let ctx = ctx("https://cdn.example.com/index.m3u8");
        let link = ctx.link("ts-proxy", "https://cdn.example.com/seg.ts");
        let parsed = Url::parse(&link).unwrap();
        let raw = parsed
            .query_pairs()
            .find(|(k, _)| k == "headers")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let decoded = CallerHeaders::parse(Some(&raw)).unwrap();
        assert_eq!(decoded, ctx.headers);
    }
}
