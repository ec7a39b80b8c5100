// UWB TDOA Server - Main Entry Point
// Anchor clock sync, quorum aggregation and multilateration over HTTP
// Licensed under AGPL v3

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use uwb_tdoa_server::config::Config;
use uwb_tdoa_server::coordinator::Coordinator;
use uwb_tdoa_server::net::{http, output_tcp};
use uwb_tdoa_server::output::{JsonLinesOutput, LogOutput};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    init_logging(config.verbose);

    info!("Starting UWB TDOA server");

    let engine = config.engine_config()?;
    info!(
        "Anchors: {} (reference {})",
        engine.geometry.ids().collect::<Vec<_>>().join(", "),
        engine.geometry.reference().id
    );

    let coordinator = Arc::new(Coordinator::new_with_status(
        engine,
        config.work_dir.clone(),
        config.status_interval,
    ));
    coordinator.init_work_dir().await;
    coordinator.add_output(Box::new(LogOutput)).await;

    let coordinator_clone = coordinator.clone();
    tokio::spawn(async move {
        coordinator_clone.run().await;
    });

    // Position feed: one broadcast channel shared by all listeners
    let (tx, _rx) = tokio::sync::broadcast::channel(100);
    for addr in &config.position_listen {
        match output_tcp::bind_position_feed(addr).await {
            Ok(listener) => {
                tokio::spawn(output_tcp::serve_position_feed(listener, tx.clone()));
            }
            Err(e) => error!("Failed to start position feed on {}: {}", addr, e),
        }
    }
    if !config.position_listen.is_empty() {
        coordinator.add_output(Box::new(JsonLinesOutput::new(Some(tx.clone())))).await;
    }

    let listener = tokio::net::TcpListener::bind(&config.http_listen).await?;
    info!("HTTP API listening on {}", listener.local_addr()?);
    if config.work_dir.is_none() {
        warn!("No --work-dir given, state.json will not be written");
    }
    let app = http::router(coordinator.clone(), config.work_dir.as_deref());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    info!("Server ready");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal (Ctrl+C)");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            return Err(err.into());
        }
    }

    info!("Shutting down...");
    coordinator.write_state().await;
    let stats = coordinator.stats().await;
    info!(
        "Server stopped. {} positions, {} solver failures, {} rejected reports",
        stats.positions, stats.solver_failures, stats.rejected_reports
    );

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}
