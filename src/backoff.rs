use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::sleep;

use crate::services::bus::{ingress_routing_key, BusPublisher, PublishHeaders, PROCESSING_EXCHANGE};

/// Delay used when the configured delay table is empty.
pub const FALLBACK_DELAY_MS: u64 = 30_000;

/// Schedules delay-deferred republishes for retryable failures.
///
/// Each republish owns its own timer on a spawned task, so the consumer loop
/// hands the original delivery straight back to the ack path. A worker crash
/// during the delay loses the scheduled republish; a broker-native delayed
/// exchange would close that gap and can be slotted in here.
pub struct RetryScheduler {
    bus: Arc<dyn BusPublisher>,
    delays_ms: Vec<u64>,
}

impl RetryScheduler {
    pub fn new(bus: Arc<dyn BusPublisher>, delays_ms: Vec<u64>) -> Self {
        Self { bus, delays_ms }
    }

    /// Backoff delay for a message about to carry `new_retry_count`:
    /// `delays[new_retry_count - 1]`, sticky at the last entry.
    pub fn delay_for(&self, new_retry_count: u32) -> Duration {
        let index = (new_retry_count.max(1) as usize - 1).min(self.delays_ms.len().saturating_sub(1));
        let ms = self.delays_ms.get(index).copied().unwrap_or(FALLBACK_DELAY_MS);
        Duration::from_millis(ms)
    }

    /// Schedule a republish of `payload` to its partition's ingress routing
    /// key after the backoff delay. Returns once the republish is scheduled;
    /// the caller may then ack the original delivery.
    pub fn schedule_republish(&self, payload: Vec<u8>, partition: u32, new_retry_count: u32) {
        let delay = self.delay_for(new_retry_count);
        let bus = Arc::clone(&self.bus);
        let routing_key = ingress_routing_key(partition);

        tracing::info!(
            partition,
            retry_count = new_retry_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduling republish"
        );

        tokio::spawn(async move {
            sleep(delay).await;

            let headers = PublishHeaders {
                partition: Some(partition),
                retry_count: Some(new_retry_count),
                ..Default::default()
            };

            match bus
                .publish(PROCESSING_EXCHANGE, &routing_key, &payload, headers)
                .await
            {
                Ok(()) => {
                    counter!("jobs_retried_total").increment(1);
                    tracing::debug!(partition, retry_count = new_retry_count, "Republished job");
                }
                Err(e) => {
                    // The message was already acked; this retry attempt is lost.
                    counter!("republish_failures_total").increment(1);
                    tracing::error!(
                        partition,
                        retry_count = new_retry_count,
                        error = %e,
                        "Failed to republish job for retry"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::services::bus::BusError;

    #[derive(Default)]
    struct CaptureBus {
        published: Mutex<Vec<(String, String, Vec<u8>, PublishHeaders)>>,
    }

    #[async_trait]
    impl BusPublisher for CaptureBus {
        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            payload: &[u8],
            headers: PublishHeaders,
        ) -> Result<(), BusError> {
            self.published.lock().unwrap().push((
                exchange.to_string(),
                routing_key.to_string(),
                payload.to_vec(),
                headers,
            ));
            Ok(())
        }
    }

    fn scheduler_with(delays: Vec<u64>) -> (RetryScheduler, Arc<CaptureBus>) {
        let bus = Arc::new(CaptureBus::default());
        (RetryScheduler::new(bus.clone(), delays), bus)
    }

    #[test]
    fn delays_index_by_retry_count_and_stick_at_the_last() {
        let (scheduler, _) = scheduler_with(vec![5_000, 15_000, 30_000]);

        assert_eq!(scheduler.delay_for(1), Duration::from_millis(5_000));
        assert_eq!(scheduler.delay_for(2), Duration::from_millis(15_000));
        assert_eq!(scheduler.delay_for(3), Duration::from_millis(30_000));
        assert_eq!(scheduler.delay_for(4), Duration::from_millis(30_000));
        assert_eq!(scheduler.delay_for(9), Duration::from_millis(30_000));
    }

    #[test]
    fn delay_table_is_monotone() {
        let (scheduler, _) = scheduler_with(vec![5_000, 15_000, 30_000]);
        for k in 1..3 {
            assert!(scheduler.delay_for(k) <= scheduler.delay_for(k + 1));
        }
    }

    #[test]
    fn empty_delay_table_falls_back_instead_of_crashing() {
        let (scheduler, _) = scheduler_with(Vec::new());
        assert_eq!(
            scheduler.delay_for(1),
            Duration::from_millis(FALLBACK_DELAY_MS)
        );
        assert_eq!(
            scheduler.delay_for(7),
            Duration::from_millis(FALLBACK_DELAY_MS)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn republish_preserves_payload_and_partition_and_bumps_retry_count() {
        let (scheduler, bus) = scheduler_with(vec![50]);

        scheduler.schedule_republish(b"original-event".to_vec(), 2, 3);

        // Not published before the delay elapses.
        tokio::task::yield_now().await;
        assert!(bus.published.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;

        let published = bus.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (exchange, routing_key, payload, headers) = &published[0];
        assert_eq!(exchange, PROCESSING_EXCHANGE);
        assert_eq!(routing_key, "image.uploaded.partition.2");
        assert_eq!(payload, b"original-event");
        assert_eq!(headers.partition, Some(2));
        assert_eq!(headers.retry_count, Some(3));
    }
}
