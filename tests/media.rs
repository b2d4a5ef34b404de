//! Range-aware streaming through `/api/video-proxy`.

mod common;

use common::{client, spawn_proxy, test_config};
use reqwest::StatusCode;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn video_url(proxy: &common::TestProxy, target: &str, extra: &str) -> String {
    proxy.url(&format!(
        "/api/video-proxy?url={}{}",
        urlencoding::encode(target),
        extra
    ))
}

async fn mount_video(origin: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/movie.mp4"))
        .and(header("range", "bytes=0-9"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Type", "video/mp4")
                .insert_header("Content-Range", "bytes 0-9/100")
                .insert_header("X-Internal", "secret")
                .set_body_bytes(vec![1u8; 10]),
        )
        .mount(origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/movie.mp4"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "video/mp4")
                .set_body_bytes(vec![1u8; 100]),
        )
        .mount(origin)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/movie.mp4"))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "video/mp4"))
        .mount(origin)
        .await;
}

#[tokio::test]
async fn ranged_request_yields_partial_content() {
    let origin = MockServer::start().await;
    mount_video(&origin).await;
    let proxy = spawn_proxy(test_config()).await;

    let response = client()
        .get(video_url(&proxy, &format!("{}/movie.mp4", origin.uri()), ""))
        .header("Range", "bytes=0-9")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let headers = response.headers().clone();
    assert_eq!(headers["content-range"], "bytes 0-9/100");
    assert_eq!(headers["accept-ranges"], "bytes");
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(
        headers["cache-control"],
        "no-cache, no-store, must-revalidate"
    );
    assert!(!headers.contains_key("x-internal"));
    assert_eq!(response.bytes().await.unwrap().len(), 10);
}

#[tokio::test]
async fn range_ignored_upstream_yields_ok() {
    let origin = MockServer::start().await;
    mount_video(&origin).await;
    let proxy = spawn_proxy(test_config()).await;

    let response = client()
        .get(video_url(&proxy, &format!("{}/movie.mp4", origin.uri()), ""))
        .header("Range", "bytes=0-99")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["accept-ranges"], "bytes");
    assert_eq!(response.bytes().await.unwrap().len(), 100);
}

#[tokio::test]
async fn unranged_request_yields_ok_with_cache_headers() {
    let origin = MockServer::start().await;
    mount_video(&origin).await;
    let proxy = spawn_proxy(test_config()).await;

    let response = client()
        .get(video_url(
            &proxy,
            &format!("{}/movie.mp4", origin.uri()),
            "&cache=true",
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["cache-control"],
        "public, max-age=3600, stale-while-revalidate=86400"
    );
    assert_eq!(response.headers()["vary"], "Range");
    assert_eq!(response.bytes().await.unwrap().len(), 100);
}

#[tokio::test]
async fn head_returns_headers_only() {
    let origin = MockServer::start().await;
    mount_video(&origin).await;
    let proxy = spawn_proxy(test_config()).await;

    let response = client()
        .head(video_url(&proxy, &format!("{}/movie.mp4", origin.uri()), ""))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "video/mp4");
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn referer_is_forwarded() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/protected.mp4"))
        .and(header("referer", "https://site.example/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/protected.mp4"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&origin)
        .await;
    let proxy = spawn_proxy(test_config()).await;

    let response = client()
        .get(video_url(
            &proxy,
            &format!("{}/protected.mp4", origin.uri()),
            &format!("&referer={}", urlencoding::encode("https://site.example/")),
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn upstream_errors_are_wrapped_in_json() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.mp4"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&origin)
        .await;
    let proxy = spawn_proxy(test_config()).await;

    let response = client()
        .get(video_url(&proxy, &format!("{}/missing.mp4", origin.uri()), ""))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Upstream server returned 404");

    let response = client()
        .get(video_url(&proxy, "http://127.0.0.1:1/x.mp4", ""))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "An unexpected error occurred.");
}

#[tokio::test]
async fn missing_url_and_preflight() {
    let proxy = spawn_proxy(test_config()).await;

    let response = client()
        .get(proxy.url("/api/video-proxy"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.text().await.unwrap(), "URL parameter is required");

    let response = client()
        .request(reqwest::Method::OPTIONS, proxy.url("/api/video-proxy"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["access-control-allow-methods"],
        "GET, HEAD, OPTIONS"
    );
    assert_eq!(response.headers()["access-control-max-age"], "86400");
}
