use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::post;
use pipeline_core::acknowledgement::AcknowledgementSetManager;
use pipeline_core::buffer::BoundedBuffer;
use pipeline_core::config::{HttpSourceConfig, PipelineConfig, load_config};
use pipeline_core::ingestor::Ingestor;
use pipeline_core::invoke::{BatchInvokeProcessor, HttpInvoker, JsonCodec};
use pipeline_core::sink::LogSink;
use pipeline_core::source::LogHttpService;
use pipeline_core::telemetry::{self, InMemoryMetrics};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// This is the entry point for running a long-running pipeline on container
/// hosting services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config (path as first argument, else the PIPELINE_CONFIG variable).
///     Serve the HTTP log source into the buffer.
///     Run the ingestor (buffer -> remote function -> log sink) and the
///     acknowledgement monitor until Ctrl-C.
///     Shut down: stop the server, drain the buffer, expire pending sets.
#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing_with("pipeline_core=info,runner_container=info");

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref()).await?;
    run(config).await
}

async fn run(config: PipelineConfig) -> Result<()> {
    let metrics = Arc::new(InMemoryMetrics::with_prefix(config.name.as_str()));
    let buffer = Arc::new(
        BoundedBuffer::new(
            format!("{}.buffer", config.name),
            config.buffer.capacity,
            config.buffer.batch_size,
        )
        .context("invalid buffer settings")?,
    );
    let acknowledgements = Arc::new(AcknowledgementSetManager::new(metrics.clone()));

    let invoke = config.processor.batch_invoke.clone();
    let endpoint = invoke
        .endpoint
        .clone()
        .context("processor.batch_invoke.endpoint is required to run in a container")?;
    let invoker = HttpInvoker::new(&endpoint, &invoke.function_name);
    let codec = JsonCodec::new(invoke.batch.key_name.clone());
    let processor = BatchInvokeProcessor::new(invoker, codec, invoke).with_metrics(metrics.clone());

    let ingestor = Arc::new(
        Ingestor::new(
            buffer.clone(),
            processor,
            LogSink::new(metrics.clone()),
            acknowledgements.clone(),
            config.buffer.read_timeout(),
        )
        .with_metrics(metrics.clone()),
    );

    let ct = CancellationToken::new();
    let monitor = acknowledgements
        .clone()
        .spawn_monitor(config.acknowledgements.monitor_interval(), ct.clone());
    let worker = {
        let ingestor = ingestor.clone();
        let ct = ct.clone();
        tokio::spawn(async move { ingestor.run(ct).await })
    };

    let http_config = config.sources.http.clone().unwrap_or_default();
    let service = Arc::new(LogHttpService::new(
        buffer.clone(),
        http_config.clone(),
        metrics.clone(),
    ));
    if let Err(err) = serve(service, &http_config, ct.clone()).await {
        error!(error = %err, "http server failed");
    }

    ct.cancel();
    match worker.await.context("ingestor task panicked")? {
        Ok(()) => {}
        Err(err) => error!(error = %err, "ingestor stopped with an error"),
    }
    monitor.await.context("acknowledgement monitor panicked")?;

    let processed = ingestor
        .shutdown()
        .await
        .context("failed to drain the buffer on shutdown")?;
    info!(
        processed,
        metrics = %serde_json::to_string(&metrics.snapshot())?,
        "pipeline stopped"
    );
    Ok(())
}

async fn serve(
    service: Arc<LogHttpService>,
    config: &HttpSourceConfig,
    ct: CancellationToken,
) -> Result<()> {
    // request length is enforced by the service so it is counted
    let app = Router::new()
        .route(&config.path, post(ingest))
        .layer(DefaultBodyLimit::disable())
        .with_state(service);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!(port = config.port, path = %config.path, "http log source listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(ct))
        .await
        .context("http server error")
}

async fn ingest(State(service): State<Arc<LogHttpService>>, body: Bytes) -> StatusCode {
    service.handle(&body).await
}

async fn shutdown_signal(ct: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
        }
        _ = ct.cancelled() => {}
    }
    ct.cancel();
}
