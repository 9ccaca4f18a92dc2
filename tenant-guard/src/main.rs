use service_core::observability::logging::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tenant_guard::{
    build_router,
    config::TenancyConfig,
    services::{JwtVerifier, PgDatastore},
    Collaborators, TenantGuard,
};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    let config = TenancyConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        environment = ?config.environment,
        "Starting tenant guard"
    );

    let store = PgDatastore::new(&config.database.url, config.database.max_connections).await?;
    store.health_check().await?;
    tracing::info!("Database initialized successfully");

    let verifier = JwtVerifier::new(&config.jwt)?;
    let collaborators = Collaborators::from_store(Arc::new(store), Arc::new(verifier));

    let guard = Arc::new(TenantGuard::new(config.clone(), collaborators));
    guard.start();

    let app = build_router(guard.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    service_core::axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match guard.shutdown().await {
        Ok(flushed) => tracing::info!(flushed, "Audit queue drained"),
        Err(e) => tracing::error!(error = %e, "Audit queue not fully drained on shutdown"),
    }
    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
