//! codeshare-server: serves shared codespaces over WebSocket.
//!
//! Configuration comes from `CODESHARE_*` environment variables, optionally
//! loaded from a `.env` file. Logging is controlled by `RUST_LOG`.

use std::process::ExitCode;

use codeshare_sync::{DocumentStore, ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "Starting codeshare server on {} (debounce {:?}, echo_to_sender {})",
        config.bind_addr,
        config.persist_debounce,
        config.echo_to_sender
    );

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to open document store: {e}");
            return ExitCode::FAILURE;
        }
    };

    match server.documents().store().list_slugs() {
        Ok(slugs) => log::info!("{} documents in store", slugs.len()),
        Err(e) => log::warn!("Could not count stored documents: {e}"),
    }

    let code = tokio::select! {
        result = server.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                log::error!("Server stopped: {e}");
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutdown requested");
            ExitCode::SUCCESS
        }
    };

    server.shutdown().await;
    let stats = server.stats().await;
    log::info!(
        "Served {} connections, {} frames ({} malformed), {} documents persisted",
        stats.total_connections,
        stats.frames_received,
        stats.malformed_frames,
        stats.persistence.persisted
    );
    code
}
