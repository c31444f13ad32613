use std::sync::Arc;

use docproc::api::{ApiServer, ApiServerConfig, AppState};
use docproc::config::AppConfig;
use docproc::logging::{self, LogOptions};
use docproc::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env_or_default();

    // Keep the guard alive so buffered log lines are written on exit.
    let log_options = LogOptions::new(&config.log_dir).with_json(config.log_json);
    let (logging_config, _log_guard) = logging::init_logging(log_options)?;

    tracing::info!(
        queue_url = %config.queue_url,
        storage_root = %config.storage_root,
        "Starting docproc"
    );

    let services = Arc::new(ServiceContainer::builder(config).build().await?);
    services.initialize().await?;
    logging_config.spawn_retention(services.cancellation_token());

    let state = AppState::new(services.clone()).with_logging_config(logging_config);
    let server = ApiServer::new(ApiServerConfig::from_env_or_default(), state);
    let server_token = server.cancel_token();
    let mut server_task = tokio::spawn(async move { server.run().await });

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
            server_token.cancel();
            match server_task.await {
                Ok(Err(e)) => tracing::error!(error = %e, "API server error"),
                Err(e) => tracing::error!(error = %e, "API server task failed"),
                Ok(Ok(())) => {}
            }
        }
        result = &mut server_task => {
            match result {
                Ok(Err(e)) => tracing::error!(error = %e, "API server stopped"),
                Err(e) => tracing::error!(error = %e, "API server task failed"),
                Ok(Ok(())) => {}
            }
        }
    }

    services.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
