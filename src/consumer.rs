use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use metrics::{counter, gauge, histogram};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::app_state::WorkerContext;
use crate::classify::{classify, ErrorCode};
use crate::models::job::{
    partition_from_routing_key, DeliveryContext, EventEnvelope, ImageJob, HEADER_PARTITION,
    HEADER_RETRY_COUNT,
};
use crate::models::outcome::PhaseRecorder;
use crate::services::bus::{ingress_queue, BusError};
use crate::services::publisher::{FailedPayload, ProcessedPayload};

/// What the broker should be told about a processed delivery. Exactly one
/// disposition is produced per delivery on every non-crash path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge: the job succeeded or its retry was handed to the
    /// backoff scheduler.
    Ack,
    /// Reject without requeue; the broker routes the message to the DLQ.
    DeadLetter,
}

/// Decode one delivery, run the pipeline, classify the outcome, and emit
/// events. Pure with respect to the broker: the caller applies the returned
/// disposition.
pub async fn handle_delivery(
    ctx: &WorkerContext,
    delivery_ctx: &DeliveryContext,
    payload: &[u8],
) -> Disposition {
    let envelope: EventEnvelope<ImageJob> = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(
                partition = delivery_ctx.partition,
                error = %e,
                "Discarding malformed message"
            );
            counter!("jobs_failed_total", "error_code" => ErrorCode::UnknownError.to_string())
                .increment(1);
            counter!("jobs_dead_lettered_total").increment(1);

            publish_failed_event(
                ctx,
                FailedPayload {
                    image_id: None,
                    user_id: None,
                    error: format!("malformed message payload: {}", e),
                    error_code: ErrorCode::UnknownError,
                    retry_count: delivery_ctx.retry_count,
                },
            )
            .await;
            return Disposition::DeadLetter;
        }
    };
    let job = envelope.payload;

    // A retry count above the budget means the republish path misbehaved;
    // dead-letter without burning another pipeline run.
    if delivery_ctx.retry_count > ctx.max_retries {
        tracing::warn!(
            image_id = %job.image_id,
            retry_count = delivery_ctx.retry_count,
            max_retries = ctx.max_retries,
            "Retry count exceeds budget, dead-lettering without execution"
        );
        counter!("jobs_dead_lettered_total").increment(1);
        return Disposition::DeadLetter;
    }

    tracing::info!(
        image_id = %job.image_id,
        partition = delivery_ctx.partition,
        retry_count = delivery_ctx.retry_count,
        style = %job.style,
        "Processing image job"
    );

    let timings = PhaseRecorder::new();
    let started = Instant::now();

    match ctx.pipeline.run(&job, &timings).await {
        Ok(success) => {
            let processing_time = success.timings.total_ms();
            histogram!("job_processing_seconds").record(started.elapsed().as_secs_f64());
            counter!("jobs_processed_total", "style" => job.style.clone()).increment(1);

            tracing::info!(
                image_id = %job.image_id,
                processed_url = %success.processed_url,
                processing_time_ms = processing_time,
                "Image processed"
            );

            publish_processed_event(
                ctx,
                ProcessedPayload {
                    image_id: job.image_id,
                    user_id: job.user_id,
                    processed_url: success.processed_url,
                    public_id: success.public_id,
                    style: job.style,
                    processing_time,
                },
            )
            .await;
            Disposition::Ack
        }
        Err(error) => {
            let classification = classify(&error);
            let failure_phase = timings.snapshot().failure_phase();

            tracing::warn!(
                image_id = %job.image_id,
                error = %error,
                error_code = %classification.code,
                retryable = classification.retryable,
                failure_phase,
                retry_count = delivery_ctx.retry_count,
                "Pipeline failed"
            );

            if classification.retryable && delivery_ctx.retry_count < ctx.max_retries {
                // Republish the original payload verbatim; the scheduler owns
                // the delay so the original can be acked right away.
                ctx.retries.schedule_republish(
                    payload.to_vec(),
                    delivery_ctx.partition,
                    delivery_ctx.retry_count + 1,
                );
                Disposition::Ack
            } else {
                counter!("jobs_failed_total", "error_code" => classification.code.to_string())
                    .increment(1);
                counter!("jobs_dead_lettered_total").increment(1);

                publish_failed_event(
                    ctx,
                    FailedPayload {
                        image_id: Some(job.image_id),
                        user_id: Some(job.user_id),
                        error: error.to_string(),
                        error_code: classification.code,
                        retry_count: delivery_ctx.retry_count,
                    },
                )
                .await;
                Disposition::DeadLetter
            }
        }
    }
}

/// Outcome-publish failures never block the ack path; duplicates across
/// delivery attempts are tolerable, lost acks are not.
async fn publish_processed_event(ctx: &WorkerContext, payload: ProcessedPayload) {
    if let Err(e) = ctx.results.publish_processed(payload).await {
        counter!("outcome_publish_failures_total").increment(1);
        tracing::error!(error = %e, "Failed to publish ImageProcessed event");
    }
}

async fn publish_failed_event(ctx: &WorkerContext, payload: FailedPayload) {
    if let Err(e) = ctx.results.publish_failed(payload).await {
        counter!("outcome_publish_failures_total").increment(1);
        tracing::error!(error = %e, "Failed to publish image.failed event");
    }
}

/// Consume one partition queue until shutdown. Each delivery is processed on
/// its own task; the broker-side prefetch bound is the only concurrency cap.
pub async fn run_partition(
    ctx: Arc<WorkerContext>,
    channel: Channel,
    partition: u32,
    prefetch: u16,
    shutdown: CancellationToken,
) -> Result<(), BusError> {
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await?;

    let queue = ingress_queue(partition);
    let consumer_tag = format!("{}-partition-{}", ctx.worker_id, partition);
    let mut consumer = channel
        .basic_consume(
            &queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    tracing::info!(partition, queue = %queue, prefetch, "Partition consumer started");

    let in_flight = TaskTracker::new();

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => {
                // Stop new deliveries; in-flight tasks keep running below.
                channel
                    .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                    .await
                    .ok();
                tracing::info!(partition, "Partition consumer cancelled");
                break;
            }
            next = consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    tracing::error!(partition, error = %e, "Consumer stream error");
                    return Err(e.into());
                }
                None => {
                    tracing::warn!(partition, "Consumer stream closed by broker");
                    break;
                }
            }
        };

        let ctx = Arc::clone(&ctx);
        in_flight.spawn(async move {
            process_one(ctx, delivery, partition).await;
        });
    }

    in_flight.close();
    in_flight.wait().await;
    Ok(())
}

async fn process_one(ctx: Arc<WorkerContext>, delivery: Delivery, partition: u32) {
    let delivery_ctx = delivery_context(&delivery, partition);

    gauge!("jobs_in_flight").increment(1.0);
    let disposition = handle_delivery(&ctx, &delivery_ctx, &delivery.data).await;
    gauge!("jobs_in_flight").decrement(1.0);

    let result = match disposition {
        Disposition::Ack => delivery.acker.ack(BasicAckOptions::default()).await,
        Disposition::DeadLetter => {
            delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                })
                .await
        }
    };

    if let Err(e) = result {
        // The channel is gone; the broker will redeliver the unacked message.
        tracing::error!(
            partition,
            delivery_tag = delivery_ctx.delivery_tag,
            error = %e,
            "Failed to settle delivery"
        );
    }
}

/// Build the per-message context from broker metadata.
fn delivery_context(delivery: &Delivery, fallback_partition: u32) -> DeliveryContext {
    let headers = delivery.properties.headers().as_ref();

    let partition = header_u32(headers, HEADER_PARTITION)
        .or_else(|| partition_from_routing_key(delivery.routing_key.as_str()))
        .unwrap_or(fallback_partition);
    let retry_count = header_u32(headers, HEADER_RETRY_COUNT).unwrap_or(0);

    DeliveryContext {
        partition,
        retry_count,
        delivery_tag: delivery.delivery_tag,
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string()),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.to_string()),
        timestamp: *delivery.properties.timestamp(),
    }
}

fn header_u32(headers: Option<&FieldTable>, name: &str) -> Option<u32> {
    let value = headers?
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)?;
    match value {
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongUInt(v) => Some(*v),
        _ => None,
    }
}
