use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pixpro_worker::app_state::WorkerContext;
use pixpro_worker::backoff::RetryScheduler;
use pixpro_worker::config::WorkerConfig;
use pixpro_worker::consumer;
use pixpro_worker::pipeline::{PipelineConfig, ProcessingPipeline};
use pixpro_worker::routes::{self, health::HealthState};
use pixpro_worker::services::bus::{self, AmqpPublisher, BusPublisher};
use pixpro_worker::services::fetch::HttpImageFetcher;
use pixpro_worker::services::publisher::ResultsPublisher;
use pixpro_worker::services::storage::CloudinaryClient;
use pixpro_worker::services::transform::GeminiClient;

#[tokio::main]
async fn main() {
    // Load configuration first so the log filter can come from it.
    let config = WorkerConfig::from_env().expect("Failed to load configuration from environment");

    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .json()
        .init();

    tracing::info!(
        worker_id = %config.worker_id,
        env = %config.app_env,
        partitions = config.partition_count,
        "Starting pixpro worker"
    );

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    describe_metrics();

    // Connect to the bus (bounded retry; unrecoverable failure exits 1 so the
    // orchestrator restarts the worker)
    let connection = match bus::connect(&config.rabbitmq_url).await {
        Ok(connection) => Arc::new(connection),
        Err(e) => {
            tracing::error!(error = %e, "Could not reach RabbitMQ, giving up");
            std::process::exit(1);
        }
    };

    // Declare topology on a short-lived setup channel
    let setup_channel = connection
        .create_channel()
        .await
        .expect("Failed to open setup channel");
    bus::declare_topology(&setup_channel, &config)
        .await
        .expect("Failed to declare bus topology");

    // Initialize pipeline backends
    tracing::info!("Initializing pipeline backends");
    let fetcher = Arc::new(HttpImageFetcher::new(config.fetch_timeout()));
    let transformer = Arc::new(GeminiClient::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
    ));
    let storage = Arc::new(CloudinaryClient::new(
        config.cloudinary_cloud_name.clone(),
        config.cloudinary_api_key.clone(),
        config.cloudinary_api_secret.clone(),
    ));

    let pipeline = ProcessingPipeline::new(
        fetcher,
        transformer,
        storage,
        PipelineConfig {
            deadline: config.processing_deadline(),
            transform_inner_retry_cap: config.transform_inner_retry_cap,
        },
    );

    // Publisher channel is dedicated: consumers never publish on it directly
    let publish_channel = connection
        .create_channel()
        .await
        .expect("Failed to open publisher channel");
    let publisher: Arc<dyn BusPublisher> = Arc::new(
        AmqpPublisher::new(publish_channel)
            .await
            .expect("Failed to enable publisher confirms"),
    );

    let context = Arc::new(WorkerContext::new(
        config.worker_id.clone(),
        config.max_retries,
        pipeline,
        ResultsPublisher::new(Arc::clone(&publisher)),
        RetryScheduler::new(publisher, config.retry_delays()),
    ));

    // Start one consumer per partition, each on its own channel
    let shutdown = CancellationToken::new();
    let mut consumers = JoinSet::new();
    for partition in 0..config.partition_count {
        let channel = connection
            .create_channel()
            .await
            .expect("Failed to open partition channel");
        consumers.spawn(consumer::run_partition(
            Arc::clone(&context),
            channel,
            partition,
            config.prefetch_count,
            shutdown.clone(),
        ));
    }

    // Expose health/metrics on the side port
    let health_state = HealthState {
        worker_id: config.worker_id.clone(),
        started_at: Instant::now(),
        connection: Arc::clone(&connection),
    };
    let side_port = routes::router(health_state, prometheus_handle);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.health_port))
        .await
        .expect("Failed to bind health port");
    tracing::info!(port = config.health_port, "Health/metrics endpoint listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, side_port).await {
            tracing::error!(error = %e, "Side-port server error");
        }
    });

    tracing::info!("Worker ready, consuming from all partitions");

    // Run until a shutdown signal or a consumer dies
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, draining");
        }
        joined = consumers.join_next() => {
            match joined {
                Some(Ok(Ok(()))) => tracing::warn!("A partition consumer stopped unexpectedly"),
                Some(Ok(Err(e))) => {
                    tracing::error!(error = %e, "Partition consumer failed");
                    std::process::exit(1);
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Partition consumer panicked");
                    std::process::exit(1);
                }
                None => {}
            }
        }
    }

    // Stop pulling new deliveries; give in-flight pipelines the grace period
    // to reach an ack/nack.
    shutdown.cancel();
    let drained = tokio::time::timeout(config.shutdown_grace(), async {
        while consumers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            grace_ms = config.shutdown_grace_ms,
            "Drain grace period elapsed with work still in flight"
        );
    }

    if let Err(e) = connection.close(200, "worker shutting down").await {
        tracing::warn!(error = %e, "Error closing bus connection");
    }

    tracing::info!("Worker stopped");
}

fn describe_metrics() {
    metrics::describe_counter!(
        "jobs_processed_total",
        "Image jobs that completed the pipeline successfully"
    );
    metrics::describe_counter!(
        "jobs_failed_total",
        "Image jobs that reached a terminal failure"
    );
    metrics::describe_counter!(
        "jobs_retried_total",
        "Image jobs republished for a delayed retry"
    );
    metrics::describe_counter!(
        "jobs_dead_lettered_total",
        "Image jobs rejected to the dead-letter queue"
    );
    metrics::describe_counter!(
        "transform_inner_retries_total",
        "Transform attempts repeated inside a single pipeline run"
    );
    metrics::describe_counter!(
        "transform_passthrough_total",
        "Pipeline runs that stored the original image unchanged"
    );
    metrics::describe_counter!(
        "outcome_publish_failures_total",
        "Outcome events that could not be published"
    );
    metrics::describe_counter!(
        "republish_failures_total",
        "Scheduled republishes that failed at the bus"
    );
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Wall-clock time of one pipeline run"
    );
    metrics::describe_histogram!("phase_fetch_seconds", "Time spent fetching the source image");
    metrics::describe_histogram!(
        "phase_transform_seconds",
        "Time spent in the transform backend, including inner retries"
    );
    metrics::describe_histogram!(
        "phase_store_seconds",
        "Time spent uploading the processed image"
    );
    metrics::describe_gauge!("jobs_in_flight", "Deliveries currently being processed");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
