//! Shared harness: runs the proxy on an ephemeral port.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use hls_proxy::upstream::NoProxy;
use hls_proxy::{AppState, Config, build_router};

pub struct TestProxy {
    pub addr: SocketAddr,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn base(&self) -> String {
        format!("http://{}", self.addr)
    }
}

pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        ..Config::default()
    }
}

/// Starts the proxy with `config`; `public_url` defaults to the bound address.
pub async fn spawn_proxy(mut config: Config) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    config.port = addr.port();
    if config.public_url.is_none() {
        config.public_url = Some(format!("http://{addr}"));
    }

    let state = AppState::with_selector(config, Arc::new(NoProxy)).expect("build state");
    state.spawn_background_tasks();
    let app = build_router(state);

    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .expect("server from listener")
            .serve(app.into_make_service())
            .await
            .expect("server error");
    });

    TestProxy { addr }
}

/// Client that never follows redirects, so relayed 3xx responses stay visible.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .expect("build client")
}
