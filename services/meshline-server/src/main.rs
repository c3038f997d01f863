use std::env;
use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use meshline_config::load_fleet_config;
use meshline_server::{ClusterDispatcher, MessageServer, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const WS_PATH: &str = "/ws";

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let fleet = load_fleet_config().expect("failed to load fleet configuration");

    let mut config = ServerConfig::default();
    if let Ok(secret) = env::var("APP_SECRET") {
        config = config.with_secret(secret);
    }
    if let Ok(password) = env::var("APP_PASSWORD") {
        config = config.with_password(password);
    }
    config.validate().expect("invalid server configuration");

    let cluster = ClusterDispatcher::from_fleet(&fleet, &config, WS_PATH);
    let server = MessageServer::new(config, cluster);
    server.start().await;

    let app = Router::new().route(WS_PATH, get(meshline_server::ws_handler)).with_state(server.clone());
    let addr: SocketAddr = fleet.bind_addr().parse().expect("invalid bind address");

    match &fleet.ssls {
        Some(ssl) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem(ssl.cert.clone().into_bytes(), ssl.key.clone().into_bytes())
                .await
                .expect("invalid TLS key/cert material");
            info!(%addr, "message server listening (tls)");
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .expect("server error");
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind");
            info!(%addr, "message server listening");
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(shutdown_signal())
                .await
                .expect("server error");
        }
    }

    server.close().await;
    info!("message server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
