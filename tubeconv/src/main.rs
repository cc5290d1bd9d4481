use std::sync::Arc;

use anyhow::Context;
use mimalloc::MiMalloc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tubeconv::api::{ApiServer, AppState};
use tubeconv::config::AppConfig;
use tubeconv::jobs::JobOrchestrator;
use tubeconv::logging;
use tubeconv::pipeline::PipelineRunner;
use tubeconv::proxy::ProxyPool;
use tubeconv::resolver::YtDlpResolver;
use tubeconv::utils::fs;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env_or_default().context("Invalid configuration")?;

    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir).context("Failed to initialize logging")?;
    if let Some(filter) = config.log_filter.as_deref()
        && let Err(e) = logging_config.set_filter(filter)
    {
        warn!(error = %e, "Ignoring LOG_FILTER");
    }
    info!(filter = %logging_config.get_filter(), log_dir = %logging_config.log_dir().display(), "Logging initialized");

    fs::ensure_dir_all_with_op("creating artifact directory", &config.orchestrator.artifact_dir)
        .await?;

    let cancel_token = CancellationToken::new();
    logging_config.start_retention_cleanup(cancel_token.child_token());

    let proxies = Arc::new(ProxyPool::new(config.proxy.clone()));
    let refresh_task = proxies.start_refresh_task(cancel_token.child_token());

    let resolver = Arc::new(YtDlpResolver::new(config.resolver.clone()));
    let orchestrator = Arc::new(JobOrchestrator::new(
        config.orchestrator.clone(),
        resolver,
        proxies,
        PipelineRunner::new(config.pipeline.clone()),
        config.transcode.clone(),
    )?);
    match orchestrator.remove_stale_artifacts().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "Removed stale artifacts from a previous run"),
        Err(e) => warn!(error = %e, "Failed to clean the artifact directory"),
    }

    let server = ApiServer::with_cancel_token(
        config.api.clone(),
        AppState::new(orchestrator),
        cancel_token.clone(),
    );

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let shutdown = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = ctrl_c => info!("Received Ctrl+C, shutting down"),
            () = terminate => info!("Received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });

    let result = server.run().await;
    cancel_token.cancel();

    if let Some(handle) = refresh_task {
        let _ = handle.await;
    }

    result.context("API server failed")?;
    info!("tubeconv stopped");
    Ok(())
}
