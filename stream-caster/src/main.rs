use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stream_caster::api::{ApiServer, AppState};
use stream_caster::auth::ApiKeyStore;
use stream_caster::caster::{InMemoryStreamRepository, StreamManager};
use stream_caster::config::AppConfig;
use stream_caster::logging::init_logging;
use stream_caster::storage::{LocalStorage, install_rustls_provider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    let (logging, _log_guard) = init_logging(&config.logging)?;
    install_rustls_provider();

    tokio::fs::create_dir_all(&config.caster.temp_dir).await?;
    info!(
        max_streams = config.caster.max_streams,
        temp_dir = %config.caster.temp_dir.display(),
        media_dir = %config.storage.media_dir.display(),
        "Starting stream-caster"
    );

    let manager = Arc::new(StreamManager::new(
        config.caster.clone(),
        Arc::new(InMemoryStreamRepository::new()),
        Arc::new(LocalStorage::new(&config.storage.media_dir)),
    )?);
    let api_keys = Arc::new(ApiKeyStore::new(&config.auth));

    let background = CancellationToken::new();
    logging.start_retention_cleanup(background.clone());
    manager.start_retention_sweeper(background.clone());

    let server = ApiServer::new(config.api.clone(), AppState::new(manager.clone(), api_keys));
    let server_token = server.cancel_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        server_token.cancel();
    });

    server.run().await?;

    background.cancel();
    let stopped = manager.stop_all().await;
    info!(stopped, "stream-caster shutdown complete");

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
