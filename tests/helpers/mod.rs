//! Test doubles for driving the consumer state machine without a broker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use pixpro_worker::app_state::WorkerContext;
use pixpro_worker::backoff::RetryScheduler;
use pixpro_worker::models::job::DeliveryContext;
use pixpro_worker::pipeline::{PipelineConfig, ProcessingPipeline};
use pixpro_worker::services::bus::{BusError, BusPublisher, PublishHeaders};
use pixpro_worker::services::fetch::{FetchError, ImageFetcher};
use pixpro_worker::services::publisher::ResultsPublisher;
use pixpro_worker::services::storage::{StorageBackend, StorageError, StoredImage, UploadRequest};
use pixpro_worker::services::transform::{TransformBackend, TransformError};

/// Serves fixed bytes and counts how often it was asked.
pub struct FakeFetcher {
    bytes: Vec<u8>,
    calls: AtomicU32,
}

impl FakeFetcher {
    pub fn new(bytes: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            bytes: bytes.to_vec(),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.bytes.clone())
    }
}

/// Behavior applied to every transform call.
#[derive(Clone)]
pub enum TransformMode {
    /// Return the given styled bytes.
    Succeed(Vec<u8>),
    /// Answer without an image payload (pass-through trigger).
    Empty,
    /// Raise a rate-limit fault on every attempt.
    RateLimit,
    /// Never return within any realistic deadline.
    Hang,
}

pub struct FakeTransformer {
    mode: TransformMode,
    attempts: AtomicU32,
}

impl FakeTransformer {
    pub fn new(mode: TransformMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            attempts: AtomicU32::new(0),
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransformBackend for FakeTransformer {
    async fn transform(&self, _image: &[u8], _style: &str) -> Result<Option<Vec<u8>>, TransformError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            TransformMode::Succeed(bytes) => Ok(Some(bytes.clone())),
            TransformMode::Empty => Ok(None),
            TransformMode::RateLimit => Err(TransformError::Api {
                status: 429,
                message: "RATE_LIMIT_EXCEEDED".to_string(),
            }),
            TransformMode::Hang => {
                tokio::time::sleep(Duration::from_secs(86_400)).await;
                Ok(None)
            }
        }
    }
}

/// Records uploads and answers with a fixed CDN URL.
pub struct FakeStorage {
    pub uploads: Mutex<Vec<(Vec<u8>, UploadRequest)>>,
    secure_url: String,
}

impl FakeStorage {
    pub fn new(secure_url: &str) -> Arc<Self> {
        Arc::new(Self {
            uploads: Mutex::new(Vec::new()),
            secure_url: secure_url.to_string(),
        })
    }
}

#[async_trait]
impl StorageBackend for FakeStorage {
    async fn store(&self, image: &[u8], request: &UploadRequest) -> Result<StoredImage, StorageError> {
        self.uploads
            .lock()
            .unwrap()
            .push((image.to_vec(), request.clone()));
        Ok(StoredImage {
            public_id: request.public_id.clone(),
            secure_url: self.secure_url.clone(),
        })
    }
}

/// A message captured by the in-memory bus.
#[derive(Debug, Clone)]
pub struct CapturedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: PublishHeaders,
}

impl CapturedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).expect("captured payload should be JSON")
    }
}

/// Captures every publish; optionally fails publishes to a given exchange.
#[derive(Default)]
pub struct CaptureBus {
    pub messages: Mutex<Vec<CapturedMessage>>,
    pub fail_exchange: Option<String>,
}

impl CaptureBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_for(exchange: &str) -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            fail_exchange: Some(exchange.to_string()),
        })
    }

    pub fn on_exchange(&self, exchange: &str) -> Vec<CapturedMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }
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
        if self.fail_exchange.as_deref() == Some(exchange) {
            return Err(BusError::Rejected {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        self.messages.lock().unwrap().push(CapturedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            headers,
        });
        Ok(())
    }
}

pub struct TestHarness {
    pub context: WorkerContext,
    pub bus: Arc<CaptureBus>,
    pub fetcher: Arc<FakeFetcher>,
    pub transformer: Arc<FakeTransformer>,
    pub storage: Arc<FakeStorage>,
}

/// Backoff delays kept short so paused-clock tests advance quickly.
pub const TEST_DELAYS_MS: [u64; 3] = [50, 100, 200];

pub fn harness(transform_mode: TransformMode) -> TestHarness {
    harness_with_bus(transform_mode, CaptureBus::new())
}

pub fn harness_with_bus(transform_mode: TransformMode, bus: Arc<CaptureBus>) -> TestHarness {
    let fetcher = FakeFetcher::new(b"original-bytes");
    let transformer = FakeTransformer::new(transform_mode);
    let storage = FakeStorage::new("https://cdn/x");

    let pipeline = ProcessingPipeline::new(
        fetcher.clone(),
        transformer.clone(),
        storage.clone(),
        PipelineConfig {
            deadline: Duration::from_secs(60),
            transform_inner_retry_cap: 5,
        },
    );

    let context = WorkerContext::new(
        "worker-test".to_string(),
        3,
        pipeline,
        ResultsPublisher::new(bus.clone()),
        RetryScheduler::new(bus.clone(), TEST_DELAYS_MS.to_vec()),
    );

    TestHarness {
        context,
        bus,
        fetcher,
        transformer,
        storage,
    }
}

pub fn delivery(partition: u32, retry_count: u32) -> DeliveryContext {
    DeliveryContext {
        partition,
        retry_count,
        delivery_tag: 1,
        message_id: None,
        correlation_id: None,
        timestamp: None,
    }
}

pub fn job_payload(image_id: &str, style: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "eventId": format!("evt_{}_testing", Utc::now().timestamp_millis()),
        "eventType": "ImageUploaded",
        "timestamp": Utc::now().to_rfc3339(),
        "payload": {
            "imageId": image_id,
            "userId": "u1",
            "originalImageUrl": format!("https://x/{}.jpg", image_id),
            "style": style,
        }
    }))
    .unwrap()
}

/// Let any scheduled republish fire: advance past the largest test delay.
pub async fn drain_scheduled_republishes() {
    tokio::time::sleep(Duration::from_millis(
        TEST_DELAYS_MS[TEST_DELAYS_MS.len() - 1] + 50,
    ))
    .await;
}
