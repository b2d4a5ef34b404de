//! Optional HTTPS listener.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use axum::{Extension, Router};
use hyper::server::conn::Http;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{self, ServerConfig};
use tracing::{debug, error, info};

use crate::error::ConfigError;

/// Request extension marking requests that arrived over TLS.
#[derive(Debug, Clone, Copy)]
pub struct TlsConnection;

/// Loads a PEM certificate chain and private key into a rustls server config.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, ConfigError> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut cert_reader)?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::read_all(&mut key_reader)?
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => Some(rustls::PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| {
            ConfigError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Accepts TLS connections forever, serving each with `app`.
pub async fn serve_tls(listener: TcpListener, config: Arc<ServerConfig>, app: Router) {
    let acceptor = TlsAcceptor::from(config);
    let app = app.layer(Extension(TlsConnection));

    if let Ok(addr) = listener.local_addr() {
        info!("HTTPS listening on https://{}", addr);
    }

    loop {
        let (tcp_stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Failed to accept HTTPS connection");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };
            if let Err(e) = Http::new().serve_connection(tls_stream, app).await {
                debug!(peer = %peer_addr, error = %e, "HTTPS connection closed with error");
            }
        });
    }
}
