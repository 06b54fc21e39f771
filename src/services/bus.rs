use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::time::sleep;

use crate::config::WorkerConfig;
use crate::models::job::{HEADER_PARTITION, HEADER_RETRY_COUNT};

/// Topic exchange that ingress jobs are published to.
pub const PROCESSING_EXCHANGE: &str = "pixpro.processing";

/// Fan-out exchange that outcome events are published to.
pub const RESULTS_EXCHANGE: &str = "image.results";

/// Queue that the dead-letter exchange drains into.
pub const DEAD_LETTER_QUEUE: &str = "image.processing.dlq";

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

pub fn ingress_queue(partition: u32) -> String {
    format!("image.processing.partition.{}", partition)
}

pub fn ingress_routing_key(partition: u32) -> String {
    format!("image.uploaded.partition.{}", partition)
}

/// Connect to the broker with bounded retry. The supervisor exits the process
/// when this gives up, so the orchestrator can reschedule the worker.
pub async fn connect(url: &str) -> Result<Connection, BusError> {
    let mut last_error = None;

    for attempt in 1..=CONNECT_ATTEMPTS {
        match Connection::connect(url, ConnectionProperties::default()).await {
            Ok(connection) => {
                tracing::info!(attempt, "Connected to RabbitMQ");
                return Ok(connection);
            }
            Err(e) => {
                tracing::warn!(
                    attempt,
                    max_attempts = CONNECT_ATTEMPTS,
                    error = %e,
                    "RabbitMQ connection failed"
                );
                last_error = Some(e);
                if attempt < CONNECT_ATTEMPTS {
                    sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    Err(BusError::Connect(last_error.expect("at least one attempt")))
}

/// Declare the exchanges and queues this worker relies on. All declarations
/// are idempotent, so racing workers converge on the same topology.
pub async fn declare_topology(channel: &Channel, config: &WorkerConfig) -> Result<(), BusError> {
    fn durable_exchange() -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        }
    }

    channel
        .exchange_declare(
            PROCESSING_EXCHANGE,
            ExchangeKind::Topic,
            durable_exchange(),
            FieldTable::default(),
        )
        .await?;

    channel
        .exchange_declare(
            RESULTS_EXCHANGE,
            ExchangeKind::Fanout,
            durable_exchange(),
            FieldTable::default(),
        )
        .await?;

    channel
        .exchange_declare(
            &config.rabbitmq_dlx_exchange,
            ExchangeKind::Fanout,
            durable_exchange(),
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            DEAD_LETTER_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            DEAD_LETTER_QUEUE,
            &config.rabbitmq_dlx_exchange,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    for partition in 0..config.partition_count {
        let queue = ingress_queue(partition);

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(config.rabbitmq_dlx_exchange.clone().into()),
        );
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongInt(config.rabbitmq_message_ttl as i32),
        );

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;
        channel
            .queue_bind(
                &queue,
                PROCESSING_EXCHANGE,
                &ingress_routing_key(partition),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    tracing::info!(
        partitions = config.partition_count,
        dlx = %config.rabbitmq_dlx_exchange,
        "Bus topology declared"
    );

    Ok(())
}

/// Routing headers attached to a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishHeaders {
    pub partition: Option<u32>,
    pub retry_count: Option<u32>,
    pub correlation_id: Option<String>,
}

/// Publish surface used by the outcome publisher and the backoff scheduler.
/// Abstracted so tests can capture messages without a broker.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: PublishHeaders,
    ) -> Result<(), BusError>;
}

/// Channel-backed publisher with confirms enabled. The channel is owned by
/// this publisher and never shared with a consumer (single-writer rule).
pub struct AmqpPublisher {
    channel: Channel,
}

impl AmqpPublisher {
    pub async fn new(channel: Channel) -> Result<Self, BusError> {
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Self { channel })
    }
}

#[async_trait]
impl BusPublisher for AmqpPublisher {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: PublishHeaders,
    ) -> Result<(), BusError> {
        let mut table = FieldTable::default();
        if let Some(partition) = headers.partition {
            table.insert(HEADER_PARTITION.into(), AMQPValue::LongInt(partition as i32));
        }
        if let Some(retry_count) = headers.retry_count {
            table.insert(
                HEADER_RETRY_COUNT.into(),
                AMQPValue::LongInt(retry_count as i32),
            );
        }

        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_content_type("application/json".into())
            .with_headers(table);
        if let Some(correlation_id) = headers.correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Nack(_) => Err(BusError::Rejected {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect to RabbitMQ after {CONNECT_ATTEMPTS} attempts: {0}")]
    Connect(lapin::Error),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("broker rejected publish to {exchange} ({routing_key})")]
    Rejected {
        exchange: String,
        routing_key: String,
    },
}
