use std::sync::Arc;

use media_relay::api::{ApiServer, ApiServerConfig, AppState};
use media_relay::config::AppConfig;
use media_relay::logging::init_logging;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env_or_default()?;
    let (logging_config, _guard) = init_logging(&config.log_dir)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        ytdlp = %config.pipeline.ytdlp_path,
        ffmpeg = %config.pipeline.ffmpeg_path,
        delivery = %config.pipeline.delivery_mode,
        staging_dir = %config.pipeline.staging_dir.display(),
        "media-relay starting"
    );

    let state =
        AppState::new(config.pipeline.clone()).with_logging_config(Arc::clone(&logging_config));
    let server = ApiServer::with_state(ApiServerConfig::from(&config), state);
    let shutdown = server.cancel_token();
    logging_config.start_retention_cleanup(shutdown.clone());

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        shutdown.cancel();
    });

    server.run().await?;
    info!("media-relay stopped");
    Ok(())
}
