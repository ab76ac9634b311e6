//! Main binary for the mesh gateway

use mesh_gateway::{
    config::GatewayConfig, http::HttpServer, init_control_plane, ReqwestHttpClient, GATEWAY_NAME,
    GATEWAY_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!("Starting {} v{}", GATEWAY_NAME, GATEWAY_VERSION);

    // Load configuration
    let config = GatewayConfig::load().await?;
    info!("Configuration loaded successfully");

    let addr: SocketAddr = config.gateway_endpoint.parse()?;

    // Wire registry, tracer and gateway
    let client = Arc::new(ReqwestHttpClient::new()?);
    let plane = init_control_plane(config, client).await?;

    let app = HttpServer::new(plane.gateway.clone()).create_router();

    info!("Starting HTTP server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
    }

    plane.shutdown().await?;
    info!("Gateway shutdown completed");
    Ok(())
}

/// `RUST_LOG` filter (default `info`); `GATEWAY_LOG_FORMAT=json` for JSON lines
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("GATEWAY_LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, shutting down");
        }
        _ = terminate => {
            info!("SIGTERM received, shutting down");
        }
    }
}
