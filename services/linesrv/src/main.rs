//! Production Line Orchestration Service (linesrv)

use std::net::SocketAddr;
use std::sync::Arc;

use axum::serve;
use clap::Parser;
use tracing::{error, info};

use common::shutdown::cancel_on_shutdown;
use errors::{LineError, LineResult};

use linesrv::{
    api::create_api_routes,
    bootstrap::{self, Args},
    persistence::{JournalPersistence, MemoryPersistence},
    AppConfig, LineService,
};

#[tokio::main]
async fn main() -> LineResult<()> {
    let args = Args::parse();
    let service_info = bootstrap::service_info();

    let config = AppConfig::load_from(&args.config)?;
    bootstrap::initialize_logging(&args, &service_info, &config)?;
    if !args.no_color {
        common::service_bootstrap::print_startup_banner(&service_info);
    }
    info!("Configuration loaded from {}", args.config.display());

    if args.validate {
        bootstrap::describe_configuration(&config);
        // Assemble once without touching the journal
        LineService::build(config, Arc::new(MemoryPersistence::new()))?;
        info!("Validation completed successfully");
        return Ok(());
    }

    let bind_address = bootstrap::determine_bind_address(
        args.bind_address.clone(),
        &config.service.api_host,
        config.service.api_port,
    );
    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        LineError::Configuration(format!("Invalid bind address '{}': {}", bind_address, e))
    })?;

    let journal = Arc::new(JournalPersistence::new(&config.persistence.journal_path));
    info!("Journal at {}", journal.path().display());

    let service = Arc::new(LineService::build(config, journal)?);
    service.start().await?;

    let socket = tokio::net::TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr).map_err(|e| LineError::StartupFailed(format!("Failed to bind to {}: {}", addr, e)))?;
    let listener = socket.listen(1024)?;

    info!("API server listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let app = create_api_routes(service.clone());
    let server_token = service.shutdown_token();
    let server_handle = tokio::spawn(async move {
        let shutdown = async move { server_token.cancelled().await };
        if let Err(e) = serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!("Server error: {}", e);
        }
    });

    cancel_on_shutdown(service.shutdown_token()).await;
    service.shutdown().await;
    if let Err(e) = server_handle.await {
        error!("API server task failed: {}", e);
    }

    info!("linesrv exited cleanly");
    Ok(())
}
