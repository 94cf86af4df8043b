use std::sync::Arc;

use anyhow::{Context, Result};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::dispatch::{peek_host, Dispatcher};

use super::{CommitAck, Transport};

/// Builds the raw-metrics consumer.
///
/// Offsets are stored manually: the consumer only advances past a message
/// once the tracking protocol released it, so a crash replays unconfirmed
/// input (at-least-once).
pub fn build(cfg: &KafkaConfig, client_id: &str) -> Result<Arc<StreamConsumer>> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", cfg.bootstrap_servers())
        .set("client.id", client_id)
        .set("group.id", &cfg.consumer_group)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .set("socket.keepalive.enable", "true")
        .create()
        .context("creating Kafka consumer")?;

    Ok(Arc::new(consumer))
}

/// Consumer loop: polls the bus and routes every message to its worker.
///
/// Returns an error only on consumer failure, which is fatal to the
/// process. Cancellation ends the loop cleanly; dropping the dispatcher
/// afterwards closes all worker input queues.
pub async fn run(
    consumer: Arc<StreamConsumer>,
    dispatcher: Dispatcher,
    commit_tx: mpsc::UnboundedSender<CommitAck>,
    topic: String,
    cancel: CancellationToken,
) -> Result<()> {
    consumer
        .subscribe(&[&topic])
        .with_context(|| format!("subscribing to {topic}"))?;
    info!(topic = %topic, workers = dispatcher.worker_count(), "consumer started");

    let shared_topic: Arc<str> = Arc::from(topic.as_str());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("consumer stopping");
                return Ok(());
            }

            message = consumer.recv() => {
                let message = message.context("consumer poll failed")?;
                let payload = message.payload().unwrap_or_default().to_vec();
                let partition = message.partition();
                let offset = message.offset();
                // release the borrowed message before handing off
                drop(message);

                // A message whose body cannot name a host still has to be
                // committed; route it to worker 0 for the ack.
                let host_id = match peek_host(&payload) {
                    Ok(host_id) => host_id,
                    Err(e) => {
                        debug!(error = %e, offset, "unroutable message");
                        0
                    }
                };

                let transport = Transport::new(
                    Arc::clone(&shared_topic),
                    partition,
                    offset,
                    host_id,
                    payload,
                    commit_tx.clone(),
                );

                dispatcher.dispatch(transport).await?;
            }
        }
    }
}

/// Committer loop: applies processed-offset acknowledgements to the
/// consumer cursor. Runs until every commit sender is gone.
pub async fn run_committer(
    consumer: Arc<StreamConsumer>,
    mut commit_rx: mpsc::UnboundedReceiver<CommitAck>,
) {
    while let Some(ack) = commit_rx.recv().await {
        if let Err(e) = consumer.store_offset(&ack.topic, ack.partition, ack.offset) {
            warn!(
                error = %e,
                topic = %ack.topic,
                partition = ack.partition,
                offset = ack.offset,
                "offset store failed"
            );
        }
    }
    debug!("committer drained");
}
