use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::classify::ErrorCode;
use crate::models::job::EventEnvelope;
use crate::services::bus::{BusError, BusPublisher, PublishHeaders, RESULTS_EXCHANGE};

/// Event type for a successfully processed image.
pub const EVENT_IMAGE_PROCESSED: &str = "ImageProcessed";

/// Event type for a permanently failed image.
pub const EVENT_IMAGE_FAILED: &str = "image.failed";

/// Payload of an `ImageProcessed` event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedPayload {
    pub image_id: String,
    pub user_id: String,
    pub processed_url: String,
    pub public_id: String,
    pub style: String,
    /// Sum of the pipeline phase timings, in milliseconds.
    pub processing_time: u64,
}

/// Payload of an `image.failed` event. Ids are null when the source message
/// was malformed and nothing could be recovered.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPayload {
    pub image_id: Option<String>,
    pub user_id: Option<String>,
    pub error: String,
    pub error_code: ErrorCode,
    pub retry_count: u32,
}

/// Producer-unique event id: `evt_<unix-ms>_<7-char-random>`.
pub fn new_event_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("evt_{}_{}", Utc::now().timestamp_millis(), &random[..7])
}

/// Publishes outcome events to the durable `image.results` fan-out exchange.
pub struct ResultsPublisher {
    bus: Arc<dyn BusPublisher>,
}

impl ResultsPublisher {
    pub fn new(bus: Arc<dyn BusPublisher>) -> Self {
        Self { bus }
    }

    pub async fn publish_processed(&self, payload: ProcessedPayload) -> Result<(), BusError> {
        self.publish_event(EVENT_IMAGE_PROCESSED, payload).await
    }

    pub async fn publish_failed(&self, payload: FailedPayload) -> Result<(), BusError> {
        self.publish_event(EVENT_IMAGE_FAILED, payload).await
    }

    async fn publish_event<T: Serialize>(
        &self,
        event_type: &str,
        payload: T,
    ) -> Result<(), BusError> {
        let event_id = new_event_id();
        let envelope = EventEnvelope {
            event_id: event_id.clone(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            payload,
        };

        let body = serde_json::to_vec(&envelope).expect("outcome events are always serializable");

        self.bus
            .publish(
                RESULTS_EXCHANGE,
                event_type,
                &body,
                PublishHeaders {
                    correlation_id: Some(event_id),
                    ..Default::default()
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_follow_the_wire_format() {
        let id = new_event_id();
        let mut parts = id.splitn(3, '_');

        assert_eq!(parts.next(), Some("evt"));

        let millis = parts.next().expect("timestamp part");
        assert!(millis.parse::<i64>().is_ok());

        let random = parts.next().expect("random part");
        assert_eq!(random.len(), 7);
        assert!(random.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn event_ids_are_unique() {
        let a = new_event_id();
        let b = new_event_id();
        assert_ne!(a, b);
    }

    #[test]
    fn failed_payload_serializes_nulls_for_malformed_messages() {
        let payload = FailedPayload {
            image_id: None,
            user_id: None,
            error: "payload is not valid JSON".to_string(),
            error_code: ErrorCode::UnknownError,
            retry_count: 0,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert!(json["imageId"].is_null());
        assert!(json["userId"].is_null());
        assert_eq!(json["errorCode"], "UNKNOWN_ERROR");
    }
}
