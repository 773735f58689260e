//! Duet server: presence, call signaling and shared whiteboards over
//! one WebSocket endpoint.
//!
//! Configured through `DUET_*` environment variables; `RUST_LOG`
//! controls verbosity.

use log::{error, info};
use std::process::ExitCode;

use duet_realtime::server::{RealtimeServer, ServerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting Duet server on {}...", config.bind_addr);

    let server = match RealtimeServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let code = tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Server stopped: {e}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            ExitCode::SUCCESS
        }
    };

    let stats = server.stats().await;
    info!(
        "Served {} connections, {} events, {} strokes; {} deliveries dropped",
        stats.total_connections, stats.total_events, stats.strokes_appended, stats.dropped_deliveries
    );
    code
}
