use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lightspeed::api::{ApiServer, AppState};
use lightspeed::config::AppConfig;
use lightspeed::history::{DisabledHistory, HistoryRecorder, SupabaseHistory};
use lightspeed::identity::GoogleTokenInfo;
use lightspeed::logging::init_logging;
use lightspeed::storage::GoogleDrive;
use lightspeed::transfer::{
    Capabilities, EncoderCommand, ExtractorCommand, Ffmpeg, TransferPipeline, YtDlp,
};
use lightspeed::utils::http_client::{build_streaming_client, install_rustls_provider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let logging = init_logging(&config.log_dir).context("Failed to initialize logging")?;

    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        strategy = %config.transfer.strategy,
        max_concurrent = config.transfer.max_concurrent,
        log_dir = %logging.log_dir().display(),
        "Starting lightspeed"
    );

    install_rustls_provider();
    let client = build_streaming_client(config.transfer.connect_timeout);

    let encoder: Arc<dyn EncoderCommand> = Arc::new(Ffmpeg::new(&config.tools.ffmpeg_path));
    let extractor: Arc<dyn ExtractorCommand> = Arc::new(YtDlp::new(&config.tools.ytdlp_path));
    let capabilities = {
        let encoder = Arc::clone(&encoder);
        let extractor = Arc::clone(&extractor);
        tokio::task::spawn_blocking(move || Capabilities::detect(encoder.as_ref(), extractor.as_ref()))
            .await
            .context("Tool detection panicked")?
    };

    let history: Arc<dyn HistoryRecorder> = match config.history.clone() {
        Some(history) => {
            info!(url = %history.url, "Transfer history enabled");
            Arc::new(SupabaseHistory::new(client.clone(), history))
        }
        None => {
            warn!("SUPABASE_URL / SUPABASE_ANON_KEY not set; transfer history is disabled");
            Arc::new(DisabledHistory)
        }
    };

    let storage = Arc::new(GoogleDrive::new(client.clone(), config.drive.clone()));
    let pipeline = TransferPipeline::new(config.transfer.clone(), client.clone(), storage, encoder, extractor)
        .with_history(history)
        .with_capabilities(capabilities)
        .with_shutdown_token(shutdown.clone());

    let identity = Arc::new(GoogleTokenInfo::new(client, config.tokeninfo_url.clone()));
    let state = AppState::new(Arc::new(pipeline), identity);
    let server = ApiServer::new(config.server.clone(), state).with_cancel_token(shutdown.clone());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received; cancelling in-flight transfers"),
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    server.run().await.context("API server failed")?;
    info!("lightspeed stopped");

    Ok(())
}
