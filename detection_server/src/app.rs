use crate::config::Config;
use crate::server::{AppState, HttpServer};
use crate::telemetry::Metrics;

use object_detection::OrtDetector;
use std::sync::Arc;
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let detector = match OrtDetector::new(&config.model, &config.labels) {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::error!("Failed to load detection model: {:?}", e);
            return Err(e.into());
        }
    };

    let app_state = AppState {
        detector,
        session_config: config.session.clone(),
        metrics: Arc::new(Metrics::new()?),
    };

    let server = HttpServer::new(app_state, &config.server.get_address()).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe());

    let signal = shutdown_signal().await;
    tracing::info!("Received {}, shutting down gracefully", signal);

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable, waiting for Ctrl+C only: {}", e);
                return ctrl_c().await;
            }
        };

        tokio::select! {
            name = ctrl_c() => name,
            _ = terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!("Ctrl+C handler failed, shutting down: {}", e);
    }
    "Ctrl+C"
}
