use crate::backoff::RetryScheduler;
use crate::pipeline::ProcessingPipeline;
use crate::services::publisher::ResultsPublisher;

/// Shared worker state passed to every partition consumer.
pub struct WorkerContext {
    pub worker_id: String,
    /// Scheduled-republish budget before a message is dead-lettered.
    pub max_retries: u32,
    pub pipeline: ProcessingPipeline,
    pub results: ResultsPublisher,
    pub retries: RetryScheduler,
}

impl WorkerContext {
    pub fn new(
        worker_id: String,
        max_retries: u32,
        pipeline: ProcessingPipeline,
        results: ResultsPublisher,
        retries: RetryScheduler,
    ) -> Self {
        Self {
            worker_id,
            max_retries,
            pipeline,
            results,
            retries,
        }
    }
}
