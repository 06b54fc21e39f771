use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// AMQP header carrying the partition a message belongs to.
pub const HEADER_PARTITION: &str = "x-partition";

/// AMQP header carrying how many times a message has been republished.
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";

/// Wire envelope shared by ingress jobs and egress outcome events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    pub event_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: T,
}

/// An image-processing request, carried as the envelope payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageJob {
    /// Unique identifier of the logical work item.
    pub image_id: String,
    /// Owner of the image; passed through to outcome events.
    pub user_id: String,
    /// Fetchable URL of the source image.
    pub original_image_url: String,
    /// Requested transform style (also a metric label and prompt fragment).
    pub style: String,
}

/// Broker-side metadata for one received delivery, built by the consumer.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    /// Partition index in `[0, partition_count)`.
    pub partition: u32,
    /// Times this message has been republished. 0 on first delivery.
    pub retry_count: u32,
    /// Broker-assigned handle needed for ack/nack.
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub timestamp: Option<u64>,
}

/// Recover the partition index from a `...partition.<p>` routing key or queue
/// name. Fallback for messages published without an `x-partition` header.
pub fn partition_from_routing_key(routing_key: &str) -> Option<u32> {
    let (prefix, suffix) = routing_key.rsplit_once('.')?;
    if !prefix.ends_with("partition") {
        return None;
    }
    suffix.parse().ok()
}
