//! End-to-end tests for the CORS forwarding surface.

mod common;

use common::{client, spawn_proxy, test_config};
use reqwest::StatusCode;
use wiremock::matchers::{body_string, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn redirect(server: &MockServer, from: &str, status: u16, to: &str) {
    Mock::given(method("GET"))
        .and(path(from))
        .respond_with(ResponseTemplate::new(status).insert_header("Location", to))
        .mount(server)
        .await;
}

#[tokio::test]
async fn follows_redirect_chain_and_reports_hops() {
    let origin = MockServer::start().await;
    redirect(&origin, "/a", 302, "/b").await;
    redirect(&origin, "/b", 301, "/c").await;
    Mock::given(method("GET"))
        .and(path("/c"))
        .respond_with(ResponseTemplate::new(200).set_body_string("done"))
        .mount(&origin)
        .await;

    let proxy = spawn_proxy(test_config()).await;
    let response = client()
        .get(proxy.url(&format!("/{}/a", origin.uri())))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(headers["x-request-url"], format!("{}/a", origin.uri()).as_str());
    assert_eq!(headers["x-final-url"], format!("{}/c", origin.uri()).as_str());
    assert_eq!(
        headers["x-cors-redirect-1"],
        format!("302 {}/b", origin.uri()).as_str()
    );
    assert_eq!(
        headers["x-cors-redirect-2"],
        format!("301 {}/c", origin.uri()).as_str()
    );
    let exposed = headers["access-control-expose-headers"].to_str().unwrap();
    assert!(exposed.contains("x-final-url"));
    assert_eq!(response.text().await.unwrap(), "done");
}

#[tokio::test]
async fn relays_redirect_once_limit_is_exceeded() {
    let origin = MockServer::start().await;
    redirect(&origin, "/r0", 302, "/r1").await;
    redirect(&origin, "/r1", 302, "/r2").await;
    redirect(&origin, "/r2", 302, "/r3").await;

    let mut config = test_config();
    config.max_redirects = 2;
    let proxy = spawn_proxy(config).await;

    let response = client()
        .get(proxy.url(&format!("/{}/r0", origin.uri())))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers()["location"],
        format!("{}/{}/r3", proxy.base(), origin.uri()).as_str()
    );
    assert!(response.headers().contains_key("x-cors-redirect-2"));
    assert!(!response.headers().contains_key("x-cors-redirect-3"));
}

#[tokio::test]
async fn temporary_redirect_is_relayed_through_proxy() {
    let origin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(307).insert_header("Location", "/elsewhere"))
        .mount(&origin)
        .await;

    let proxy = spawn_proxy(test_config()).await;
    let response = client()
        .post(proxy.url(&format!("/{}/upload", origin.uri())))
        .body("data")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response.headers()["location"],
        format!("{}/{}/elsewhere", proxy.base(), origin.uri()).as_str()
    );
}

#[tokio::test]
async fn forwards_method_and_body() {
    let origin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(body_string("payload"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .mount(&origin)
        .await;

    let proxy = spawn_proxy(test_config()).await;
    let response = client()
        .post(proxy.url(&format!("/{}/submit", origin.uri())))
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.text().await.unwrap(), "created");
}

#[tokio::test]
async fn see_other_turns_post_into_bodiless_get() {
    let origin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/form"))
        .and(body_string("name=value"))
        .respond_with(ResponseTemplate::new(303).insert_header("Location", "/result"))
        .mount(&origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/result"))
        .and(header_exists("content-type"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/result"))
        .respond_with(ResponseTemplate::new(200).set_body_string("result"))
        .mount(&origin)
        .await;

    let proxy = spawn_proxy(test_config()).await;
    let response = client()
        .post(proxy.url(&format!("/{}/form", origin.uri())))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body("name=value")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["x-cors-redirect-1"],
        format!("303 {}/result", origin.uri()).as_str()
    );
    assert_eq!(response.text().await.unwrap(), "result");

    let received = origin.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[1].url.path(), "/result");
    assert!(received[1].body.is_empty());
}

#[tokio::test]
async fn cookies_never_cross_the_proxy() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/private"))
        .and(header_exists("cookie"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/private"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "session=abc")
                .insert_header("X-Kept", "yes"),
        )
        .mount(&origin)
        .await;

    let proxy = spawn_proxy(test_config()).await;
    let response = client()
        .get(proxy.url(&format!("/{}/private", origin.uri())))
        .header("Cookie", "session=mine")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("set-cookie"));
    assert_eq!(response.headers()["x-kept"], "yes");
}

#[tokio::test]
async fn injects_configured_headers() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tagged"))
        .and(header("x-proxied-by", "hls-proxy"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&origin)
        .await;

    let mut config = test_config();
    config.set_headers = vec!["x-proxied-by:hls-proxy".to_string()];
    let proxy = spawn_proxy(config).await;

    let response = client()
        .get(proxy.url(&format!("/{}/tagged", origin.uri())))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn preflight_is_answered_locally() {
    let mut config = test_config();
    config.cors_max_age = 600;
    let proxy = spawn_proxy(config).await;

    let response = client()
        .request(reqwest::Method::OPTIONS, proxy.url("/http://example.com/x"))
        .header("Access-Control-Request-Method", "PUT")
        .header("Access-Control-Request-Headers", "x-custom")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(headers["access-control-allow-methods"], "PUT");
    assert_eq!(headers["access-control-allow-headers"], "x-custom");
    assert_eq!(headers["access-control-max-age"], "600");
}

#[tokio::test]
async fn answers_iscorsneeded_and_index() {
    let proxy = spawn_proxy(test_config()).await;

    let response = client().get(proxy.url("/iscorsneeded")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "no");

    let response = client().get(proxy.url("/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.text().await.unwrap().contains("hls-proxy"));
}

#[tokio::test]
async fn rejects_malformed_targets() {
    let proxy = spawn_proxy(test_config()).await;

    let response = client()
        .get(proxy.url("/http:/example.com/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await.unwrap().contains("two slashes"));

    let response = client()
        .get(proxy.url("/HTTP:/example.com/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await.unwrap().contains("two slashes"));

    let response = client()
        .get(proxy.url("/example.com:99999/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.text().await.unwrap(),
        "Port number too large: 99999"
    );

    let response = client()
        .get(proxy.url("/favicon.ico"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.text().await.unwrap(), "Invalid host: favicon.ico");
}

#[tokio::test]
async fn enforces_origin_policy() {
    let mut config = test_config();
    config.origin_blacklist = vec!["https://bad.example".to_string()];
    config.require_header = vec!["x-requested-with".to_string()];
    let proxy = spawn_proxy(config).await;
    let target = proxy.url("/http://127.0.0.1:1/x");

    let response = client()
        .get(&target)
        .header("Origin", "https://bad.example")
        .header("X-Requested-With", "xhr")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");

    let response = client()
        .get(&target)
        .header("Origin", "https://good.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(
        response
            .text()
            .await
            .unwrap()
            .contains("Must specify one of: x-requested-with")
    );
}

#[tokio::test]
async fn rate_limits_per_origin() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&origin)
        .await;

    let mut config = test_config();
    config.rate_limit = Some("2 5".to_string());
    let proxy = spawn_proxy(config).await;
    let target = proxy.url(&format!("/{}/x", origin.uri()));

    for _ in 0..2 {
        let response = client()
            .get(&target)
            .header("Origin", "https://busy.example")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = client()
        .get(&target)
        .header("Origin", "https://busy.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(
        response
            .text()
            .await
            .unwrap()
            .contains("limited to 2 per 5 minutes")
    );

    let response = client()
        .get(&target)
        .header("Origin", "https://quiet.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn same_origin_requests_are_redirected() {
    let proxy = spawn_proxy(test_config()).await;
    let response = client()
        .get(proxy.url("/http://app.example.com/page"))
        .header("Origin", "http://app.example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response.headers()["location"],
        "http://app.example.com/page"
    );
    assert_eq!(response.headers()["vary"], "origin");
    assert_eq!(response.headers()["cache-control"], "private");
}

#[tokio::test]
async fn unreachable_upstream_yields_not_found() {
    let proxy = spawn_proxy(test_config()).await;
    let response = client()
        .get(proxy.url("/http://127.0.0.1:1/x"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert!(
        response
            .text()
            .await
            .unwrap()
            .starts_with("Not found because of proxy error: ")
    );
}
