//! Ingestion API for the notification dispatch pipeline
//!
//! Serves notification creation, lookup and status updates over HTTP, plus
//! `/health` and `/metrics`. Delivery happens in `notification-worker`.

use notification_dispatch::{
    bootstrap::{init_tracing, load_config, wait_for_shutdown_signal},
    config::NotificationConfig,
    NotificationService,
};

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = create_cli().get_matches();

    init_tracing(matches.get_flag("json-logs"))?;

    let config = configure(&matches)?;
    config.validate().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        anyhow::anyhow!(e)
    })?;

    info!("Starting notification dispatch API");
    info!(
        "Configuration: Server {}:{}, store {:?}, queue {:?}",
        config.server.host, config.server.port, config.database.backend, config.queue.backend
    );

    let grace = Duration::from_secs(config.server.shutdown_grace_seconds);
    let service = NotificationService::new(config.clone())
        .await
        .context("Failed to initialize notification service")?;

    let app = service.router();

    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .with_context(|| format!("Invalid host address: {}", config.server.host))?,
        config.server.port,
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to address {}", addr))?;

    info!("Notification dispatch API started on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("Metrics: http://{}/metrics", addr);

    let shutdown = CancellationToken::new();
    let workers = service
        .spawn_in_process_workers(&shutdown)
        .context("Failed to start in-process workers")?;

    let mut server_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }
    });

    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => info!("Server exited"),
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task failed: {}", e),
            }
            return Ok(());
        }
    }

    info!("Shutdown signal received, draining in-flight requests...");
    shutdown.cancel();

    match tokio::time::timeout(grace, server_task).await {
        Ok(Ok(Ok(()))) => info!("Notification dispatch API stopped gracefully"),
        Ok(Ok(Err(e))) => error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => error!("Server task error during shutdown: {}", e),
        Err(_) => warn!("Grace period of {:?} elapsed, forcing shutdown", grace),
    }

    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("In-process worker error during shutdown: {}", e),
            Err(e) => error!("In-process worker task error during shutdown: {}", e),
        }
    }

    Ok(())
}

/// Create CLI argument parser
fn create_cli() -> Command {
    Command::new("notification-api")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Notification dispatch API - validates, stores and enqueues notifications")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Server host address"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Server port"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
}

/// Load configuration and apply CLI overrides
fn configure(matches: &ArgMatches) -> anyhow::Result<NotificationConfig> {
    let mut config = load_config(matches.get_one::<String>("config"))?;

    if let Some(host) = matches.get_one::<String>("host") {
        config.server.host = host.clone();
    }

    if let Some(port_str) = matches.get_one::<String>("port") {
        config.server.port = port_str
            .parse()
            .with_context(|| format!("Invalid port number '{}'", port_str))?;
    }

    Ok(config)
}
