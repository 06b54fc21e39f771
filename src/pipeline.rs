use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};

use crate::classify::classify_transform;
use crate::models::job::ImageJob;
use crate::models::outcome::{Phase, PhaseRecorder, PipelineSuccess};
use crate::services::fetch::{FetchError, ImageFetcher};
use crate::services::storage::{StorageBackend, StorageError, UploadRequest};
use crate::services::transform::{TransformBackend, TransformError};

/// Folder that processed images are uploaded into.
pub const PROCESSED_FOLDER: &str = "swifty-processed-images";

/// Output format for stored images.
pub const PROCESSED_FORMAT: &str = "jpg";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Wall-clock cap on one pipeline execution.
    pub deadline: Duration,
    /// Attempt cap for the inner transform retry loop.
    pub transform_inner_retry_cap: u32,
}

/// The fetch → transform → store pipeline, run strictly sequentially per
/// message under a single wall-clock deadline.
pub struct ProcessingPipeline {
    fetcher: Arc<dyn ImageFetcher>,
    transformer: Arc<dyn TransformBackend>,
    storage: Arc<dyn StorageBackend>,
    config: PipelineConfig,
}

impl ProcessingPipeline {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        transformer: Arc<dyn TransformBackend>,
        storage: Arc<dyn StorageBackend>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            fetcher,
            transformer,
            storage,
            config,
        }
    }

    /// Run the pipeline under the configured deadline.
    ///
    /// On timeout the stage future is dropped, which cancels its in-flight
    /// I/O and any inner-retry sleep; the partial phase timings written
    /// through `timings` remain readable for failure-phase detection.
    pub async fn run(
        &self,
        job: &ImageJob,
        timings: &PhaseRecorder,
    ) -> Result<PipelineSuccess, PipelineError> {
        if self.config.deadline.is_zero() {
            return Err(PipelineError::DeadlineExceeded);
        }

        match tokio::time::timeout(self.config.deadline, self.execute(job, timings)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::DeadlineExceeded),
        }
    }

    async fn execute(
        &self,
        job: &ImageJob,
        timings: &PhaseRecorder,
    ) -> Result<PipelineSuccess, PipelineError> {
        tracing::debug!(image_id = %job.image_id, url = %job.original_image_url, "Fetching source image");
        let started = Instant::now();
        let original = self.fetcher.fetch(&job.original_image_url).await?;
        let elapsed = started.elapsed();
        timings.record(Phase::Fetch, elapsed.as_millis() as u64);
        histogram!("phase_fetch_seconds").record(elapsed.as_secs_f64());

        tracing::debug!(
            image_id = %job.image_id,
            style = %job.style,
            bytes = original.len(),
            "Transforming image"
        );
        let started = Instant::now();
        let transformed = self.transform_with_retry(&original, &job.style).await?;
        let elapsed = started.elapsed();
        timings.record(Phase::Transform, elapsed.as_millis() as u64);
        histogram!("phase_transform_seconds").record(elapsed.as_secs_f64());

        let processed = match transformed {
            Some(bytes) => bytes,
            None => {
                // Degraded but not failed: store the original as-is.
                tracing::warn!(
                    image_id = %job.image_id,
                    style = %job.style,
                    "Transform returned no image payload, passing original through"
                );
                counter!("transform_passthrough_total").increment(1);
                original
            }
        };

        let public_id = format!(
            "processed_{}_{}",
            job.image_id,
            Utc::now().timestamp_millis()
        );
        let request = UploadRequest {
            public_id,
            folder: PROCESSED_FOLDER.to_string(),
            format: PROCESSED_FORMAT.to_string(),
        };

        tracing::debug!(image_id = %job.image_id, public_id = %request.public_id, "Storing processed image");
        let started = Instant::now();
        let stored = self.storage.store(&processed, &request).await?;
        let elapsed = started.elapsed();
        timings.record(Phase::Store, elapsed.as_millis() as u64);
        histogram!("phase_store_seconds").record(elapsed.as_secs_f64());

        Ok(PipelineSuccess {
            processed_url: stored.secure_url,
            public_id: stored.public_id,
            timings: timings.snapshot(),
        })
    }

    /// Inner retry around the transform backend. Only retryable faults are
    /// re-attempted, with a 2^k-second backoff after attempt k; the last
    /// error is rethrown once the cap is reached.
    async fn transform_with_retry(
        &self,
        image: &[u8],
        style: &str,
    ) -> Result<Option<Vec<u8>>, TransformError> {
        let cap = self.config.transform_inner_retry_cap.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.transformer.transform(image, style).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let classification = classify_transform(&e);
                    if !classification.retryable || attempt >= cap {
                        return Err(e);
                    }

                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    tracing::warn!(
                        attempt,
                        cap,
                        backoff_secs = backoff.as_secs(),
                        error = %e,
                        "Transform attempt failed, backing off"
                    );
                    counter!("transform_inner_retries_total").increment(1);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("processing deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Store(#[from] StorageError),
}
