use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hls_proxy::{AppState, Config, build_router, tls};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse().normalize();
    let state = AppState::new(config)?;
    state.spawn_background_tasks();
    let app = build_router(state.clone());

    if let (Some(cert), Some(key)) = (&state.config.tls_cert, &state.config.tls_key) {
        let tls_config = tls::load_server_config(cert, key)?;
        let listener = tokio::net::TcpListener::bind(state.config.tls_addr()).await?;
        tokio::spawn(tls::serve_tls(listener, tls_config, app.clone()));
    }

    let listener = std::net::TcpListener::bind(state.config.listen_addr())?;
    info!("HLS proxy running on http://{}", listener.local_addr()?);
    info!(public_url = %state.config.public_url(), "Playlist links point at this base URL");

    axum::Server::from_tcp(listener)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
