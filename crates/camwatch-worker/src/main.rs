//! Camera detection worker binary.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use camwatch_vision::FfmpegSource;
use camwatch_worker::{
    metrics, retention, CancelToken, FileStore, HttpDetectorFactory, LogSink, TaskManager,
    WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for HTTPS to the inference server)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::from_default_env().add_directive("camwatch=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting camwatch-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(addr) = config.metrics_addr {
        metrics::init_metrics(addr).context("failed to start metrics exporter")?;
        info!(%addr, "Metrics exporter listening");
    }

    let source = Arc::new(
        FfmpegSource::new(
            config.default_frame_width,
            config.default_frame_height,
            config.read_timeout,
        )
        .context("ffmpeg stream source unavailable")?,
    );
    let factory = Arc::new(
        HttpDetectorFactory::new(config.detector_endpoint.clone(), config.inference_timeout)
            .context("failed to build detector client")?,
    );
    let store = Arc::new(FileStore::new(
        config.storage_dir.clone(),
        config.tasks_file.clone(),
    ));
    let sink = Arc::new(LogSink);

    let retention_cancel = CancelToken::new();
    let sweeper = retention::spawn(
        store.clone(),
        config.retention_interval,
        config.external_retention_days,
        retention_cancel.clone(),
    );

    let manager = TaskManager::new(config, store, sink, source, factory)?;
    if let Err(e) = manager.start_all_enabled().await {
        error!("Failed to start enabled tasks: {}", e);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    retention_cancel.cancel();
    manager.shutdown().await;
    sweeper.await.ok();

    info!("Worker shutdown complete");
    Ok(())
}
