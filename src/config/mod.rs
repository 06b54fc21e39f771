use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// AMQP broker URL
    #[serde(default = "default_rabbitmq_url")]
    pub rabbitmq_url: String,

    /// Dead-letter exchange that permanently-failed messages are routed to
    #[serde(default = "default_dlx_exchange")]
    pub rabbitmq_dlx_exchange: String,

    /// Per-message TTL on the partition queues, in milliseconds
    #[serde(default = "default_message_ttl")]
    pub rabbitmq_message_ttl: u32,

    /// Number of partition queues this worker consumes from
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,

    /// Broker-side prefetch per partition consumer (the back-pressure knob)
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    /// Scheduled-republish budget before a message is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff delay for the first scheduled retry, in milliseconds
    #[serde(default = "default_retry_delay_1")]
    pub retry_delay_1: u64,

    /// Backoff delay for the second scheduled retry, in milliseconds
    #[serde(default = "default_retry_delay_2")]
    pub retry_delay_2: u64,

    /// Backoff delay for the third and later scheduled retries, in milliseconds
    #[serde(default = "default_retry_delay_3")]
    pub retry_delay_3: u64,

    /// Wall-clock cap on a single pipeline execution, in milliseconds
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,

    /// Attempt cap for the inner transform retry loop (rate limits etc.)
    #[serde(default = "default_transform_inner_retry_cap")]
    pub transform_inner_retry_cap: u32,

    /// Request timeout for the image fetch stage, in milliseconds
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Gemini API key for the transform backend
    pub gemini_api_key: String,

    /// Gemini model used for image transformation
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    /// Cloudinary cloud name for the store backend
    pub cloudinary_cloud_name: String,

    /// Cloudinary API key
    pub cloudinary_api_key: String,

    /// Cloudinary API secret used to sign uploads
    pub cloudinary_api_secret: String,

    /// Stable identifier for this worker instance (random by default)
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Log filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Free-form environment tag (development, staging, production)
    #[serde(default = "default_app_env")]
    pub app_env: String,

    /// Side port for the health/metrics HTTP endpoint
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// How long to wait for in-flight pipelines to ack/nack on shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_rabbitmq_url() -> String {
    "amqp://localhost:5672".to_string()
}

fn default_dlx_exchange() -> String {
    "pixpro.dlx".to_string()
}

fn default_message_ttl() -> u32 {
    300_000
}

fn default_partition_count() -> u32 {
    3
}

fn default_prefetch_count() -> u16 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_1() -> u64 {
    5_000
}

fn default_retry_delay_2() -> u64 {
    15_000
}

fn default_retry_delay_3() -> u64 {
    30_000
}

fn default_processing_timeout_ms() -> u64 {
    60_000
}

fn default_transform_inner_retry_cap() -> u32 {
    5
}

fn default_fetch_timeout_ms() -> u64 {
    30_000
}

fn default_gemini_model() -> String {
    "gemini-2.0-flash-exp".to_string()
}

fn default_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &suffix[..8])
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_app_env() -> String {
    "development".to_string()
}

fn default_health_port() -> u16 {
    9090
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Per-attempt backoff delays in milliseconds, in retry order.
    pub fn retry_delays(&self) -> Vec<u64> {
        vec![self.retry_delay_1, self.retry_delay_2, self.retry_delay_3]
    }

    pub fn processing_deadline(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
