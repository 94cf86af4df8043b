use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::config::FromClientConfigAndContext;
use rdkafka::error::KafkaError;
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, ClientContext};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::config::KafkaConfig;

use super::ProducerEvent;

/// Producer context that turns librdkafka's asynchronous delivery
/// callbacks into `ProducerEvent`s on the owning worker's channel.
struct OutputContext {
    events_tx: mpsc::UnboundedSender<ProducerEvent>,
}

impl ClientContext for OutputContext {
    fn error(&self, error: KafkaError, reason: &str) {
        // Client-level transport errors are not tied to one message but
        // poison the producer as a whole.
        let _ = self.events_tx.send(ProducerEvent::Failed {
            tracking: None,
            error: format!("{error}: {reason}"),
        });
    }
}

impl ProducerContext for OutputContext {
    type DeliveryOpaque = Box<Uuid>;

    fn delivery(&self, result: &DeliveryResult<'_>, tracking: Self::DeliveryOpaque) {
        let event = match result {
            Ok(_) => ProducerEvent::Delivered(*tracking),
            Err((error, _message)) => ProducerEvent::Failed {
                tracking: Some(*tracking),
                error: error.to_string(),
            },
        };
        let _ = self.events_tx.send(event);
    }
}

/// Async producer for derived metrics, one per worker.
///
/// Messages are keyed by asset id and hash partitioned so downstream
/// consumers observe per-asset ordering. Every message carries the
/// emission's tracking id as delivery opaque; the worker matches the
/// resulting `ProducerEvent`s against its offset tracking tables.
pub struct OutputProducer {
    producer: ThreadedProducer<OutputContext>,
    topic: String,
}

impl OutputProducer {
    pub fn new(
        cfg: &KafkaConfig,
        client_id: &str,
        events_tx: mpsc::UnboundedSender<ProducerEvent>,
    ) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", cfg.bootstrap_servers())
            .set("client.id", client_id)
            .set("request.required.acks", cfg.producer_response_strategy.required_acks())
            .set("message.send.max.retries", cfg.retries().to_string())
            // librdkafka only exposes keepalive as a switch; the configured
            // interval is honored by the kernel's defaults
            .set("socket.keepalive.enable", "true")
            .set("partitioner", "murmur2_random");

        debug!(
            topic = %cfg.producer_topic,
            acks = cfg.producer_response_strategy.required_acks(),
            retries = cfg.retries(),
            "creating producer"
        );

        let producer =
            ThreadedProducer::from_config_and_context(&client_config, OutputContext { events_tx })
                .context("creating Kafka producer")?;

        Ok(Self {
            producer,
            topic: cfg.producer_topic.clone(),
        })
    }

    /// Enqueues one derived record. Returns `QueueFull` without blocking
    /// when the local send queue is saturated; the caller retries.
    pub fn send(&self, key: &str, payload: &[u8], tracking: Uuid) -> Result<(), KafkaError> {
        let record = BaseRecord::with_opaque_to(&self.topic, Box::new(tracking))
            .key(key)
            .payload(payload);

        self.producer.send(record).map_err(|(error, _record)| error)
    }

    /// True if `error` only signals local queue saturation.
    pub fn is_queue_full(error: &KafkaError) -> bool {
        matches!(
            error,
            KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)
        )
    }

    /// Waits for outstanding deliveries during shutdown.
    pub fn flush(&self, timeout: Duration) {
        if let Err(e) = self.producer.flush(timeout) {
            debug!(error = %e, "producer flush incomplete");
        }
    }
}
