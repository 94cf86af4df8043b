use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::producer::OutputProducer;
use crate::bus::{ProducerEvent, Transport};
use crate::derive::{Registry, Routed};
use crate::lookup::Lookup;
use crate::metrics::PipelineMetrics;
use crate::wire::MetricRecord;

/// Offset bookkeeping between emission and producer confirmation.
///
/// Every emission gets a fresh tracking id; the input transports that fed
/// the emitted cycle are withheld until the producer confirms each derived
/// record carrying that id, then committed together.
#[derive(Default)]
pub struct OffsetTracker {
    outstanding: HashMap<Uuid, usize>,
    acks: HashMap<Uuid, Vec<Transport>>,
}

impl OffsetTracker {
    /// Registers `produced` in-flight messages guarding `acks`.
    pub fn track(&mut self, tracking: Uuid, produced: usize, acks: Vec<Transport>) {
        self.outstanding.insert(tracking, produced);
        self.acks.insert(tracking, acks);
    }

    /// Records one producer confirmation. Returns the released transports
    /// once the final confirmation for `tracking` arrives.
    pub fn confirm(&mut self, tracking: Uuid) -> Option<Vec<Transport>> {
        let Some(count) = self.outstanding.get_mut(&tracking) else {
            warn!(%tracking, "unknown tracking id");
            return None;
        };

        *count -= 1;
        if *count > 0 {
            return None;
        }

        self.outstanding.remove(&tracking);
        self.acks.remove(&tracking)
    }

    /// Number of emissions awaiting confirmation.
    pub fn pending(&self) -> usize {
        self.outstanding.len()
    }
}

/// One of N single-threaded pipeline processors, each owning a disjoint
/// subset of assets.
///
/// The worker multiplexes its bounded input queue, its producer's delivery
/// reports, and the shutdown token. All derivation state lives behind this
/// single task, so no locking is needed on it.
pub struct Worker {
    pub num: usize,
    registry: Registry,
    lookup: Arc<Lookup>,
    producer: OutputProducer,
    producer_events: mpsc::UnboundedReceiver<ProducerEvent>,
    input: mpsc::Receiver<Transport>,
    tracker: OffsetTracker,
    death: mpsc::Sender<anyhow::Error>,
    metrics: Arc<PipelineMetrics>,
    instance: String,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num: usize,
        registry: Registry,
        lookup: Arc<Lookup>,
        producer: OutputProducer,
        producer_events: mpsc::UnboundedReceiver<ProducerEvent>,
        input: mpsc::Receiver<Transport>,
        death: mpsc::Sender<anyhow::Error>,
        metrics: Arc<PipelineMetrics>,
        instance: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            num,
            registry,
            lookup,
            producer,
            producer_events,
            input,
            tracker: OffsetTracker::default(),
            death,
            metrics,
            instance,
            tasks: TaskTracker::new(),
            cancel,
        }
    }

    /// Event loop. Runs until shutdown or a fatal error, then drains.
    pub async fn run(mut self) {
        info!(worker = self.num, families = self.registry.len(), "worker started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = self.producer_events.recv() => match event {
                    Some(ProducerEvent::Delivered(tracking)) => {
                        self.confirm(tracking);
                    }
                    Some(ProducerEvent::Failed { tracking: _, error }) => {
                        // guarded offsets stay uncommitted; the bus
                        // redelivers them after restart
                        self.fatal(anyhow!("producer delivery failed: {error}")).await;
                        break;
                    }
                    None => break,
                },

                message = self.input.recv() => match message {
                    Some(transport) => {
                        self.process(transport).await;
                        self.metrics.input_messages.inc();
                    }
                    // closed input during shutdown races the token
                    None => break,
                },
            }
        }

        self.drain().await;
        info!(worker = self.num, "worker stopped");
    }

    /// Handles one input message. Invalid data is committed and skipped.
    async fn process(&mut self, transport: Transport) {
        if transport.payload.is_empty() {
            warn!(worker = self.num, host_id = transport.host_id, "ignoring empty message");
            self.commit(&transport);
            return;
        }

        if transport.is_heartbeat() {
            let lookup = Arc::clone(&self.lookup);
            let instance = self.instance.clone();
            let num = self.num;
            let payload = transport.payload.clone();
            self.tasks.spawn(async move {
                lookup.heartbeat(&instance, num, &payload).await;
            });
            return;
        }

        let record: MetricRecord = match serde_json::from_slice(&transport.payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(worker = self.num, error = %e, "ignoring invalid data");
                self.commit(&transport);
                return;
            }
        };

        match self.registry.update(&record, transport).await {
            // no family interested in this metric
            Ok(Routed::Unhandled(transport)) => self.commit(&transport),
            Ok(Routed::Buffered) => {}
            Ok(Routed::Emitted(emission)) => self.publish(emission).await,
            Err(e) => {
                self.fatal(anyhow!(e).context("tag lookup failed")).await;
            }
        }
    }

    /// Produces an emission's derived records under a fresh tracking id,
    /// or commits immediately when there is nothing to produce.
    async fn publish(&mut self, emission: crate::derive::Emission) {
        if emission.derived.is_empty() {
            for ack in &emission.acks {
                self.commit(ack);
            }
            return;
        }

        let tracking = Uuid::new_v4();
        let mut produced = 0usize;

        for record in &emission.derived {
            let payload = match serde_json::to_vec(record) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(worker = self.num, error = %e, path = %record.path, "ignoring unencodable record");
                    continue;
                }
            };

            if !self.send(&record.asset_id.to_string(), &payload, tracking).await {
                return;
            }
            produced += 1;
        }

        if produced == 0 {
            for ack in &emission.acks {
                self.commit(ack);
            }
            return;
        }

        self.tracker.track(tracking, produced, emission.acks);
    }

    /// Enqueues one produce request, waiting out local queue saturation.
    /// Returns false after escalating a terminal producer failure.
    async fn send(&mut self, key: &str, payload: &[u8], tracking: Uuid) -> bool {
        loop {
            match self.producer.send(key, payload, tracking) {
                Ok(()) => return true,
                Err(e) if OutputProducer::is_queue_full(&e) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => {
                    self.fatal(anyhow!(e).context("enqueueing derived metric")).await;
                    return false;
                }
            }
        }
    }

    /// Applies one producer confirmation; commits released offsets.
    fn confirm(&mut self, tracking: Uuid) {
        self.metrics.output_messages.inc();
        if let Some(acks) = self.tracker.confirm(tracking) {
            for ack in &acks {
                self.commit(ack);
            }
        }
    }

    fn commit(&self, transport: &Transport) {
        transport.commit();
        self.metrics.commits.inc();
    }

    /// Escalates a fatal error and parks until shutdown is under way.
    async fn fatal(&self, error: anyhow::Error) {
        error!(worker = self.num, error = %error, "worker died");
        let _ = self.death.send(error).await;
        self.cancel.cancelled().await;
    }

    /// Shutdown path: exhaust the input queue, flush the producer, apply
    /// residual delivery reports, and quiesce fire-and-forget tasks.
    async fn drain(&mut self) {
        while let Some(transport) = self.input.recv().await {
            self.process(transport).await;
            self.metrics.input_messages.inc();
        }

        tokio::task::block_in_place(|| self.producer.flush(Duration::from_secs(5)));

        self.producer_events.close();
        while let Some(event) = self.producer_events.recv().await {
            match event {
                ProducerEvent::Delivered(tracking) => self.confirm(tracking),
                ProducerEvent::Failed { error, .. } => {
                    error!(worker = self.num, error = %error, "delivery failed during shutdown");
                }
            }
        }

        if self.tracker.pending() > 0 {
            debug!(
                worker = self.num,
                pending = self.tracker.pending(),
                "unconfirmed emissions at shutdown; offsets withheld"
            );
        }

        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CommitAck;

    fn transport(offset: i64) -> (Transport, mpsc::UnboundedReceiver<CommitAck>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Transport::new(Arc::from("raw"), 0, offset, 1, Vec::new(), tx),
            rx,
        )
    }

    #[test]
    fn test_tracker_releases_after_final_confirmation() {
        let mut tracker = OffsetTracker::default();
        let tracking = Uuid::new_v4();
        let (t1, _rx1) = transport(10);
        let (t2, _rx2) = transport(11);

        tracker.track(tracking, 3, vec![t1, t2]);

        assert!(tracker.confirm(tracking).is_none());
        assert!(tracker.confirm(tracking).is_none());
        let released = tracker.confirm(tracking).expect("released");
        assert_eq!(released.len(), 2);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_tracker_ignores_unknown_tracking_id() {
        let mut tracker = OffsetTracker::default();
        assert!(tracker.confirm(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_tracker_keeps_emissions_independent() {
        let mut tracker = OffsetTracker::default();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let (t1, _rx1) = transport(1);
        let (t2, _rx2) = transport(2);

        tracker.track(first, 1, vec![t1]);
        tracker.track(second, 1, vec![t2]);

        let released = tracker.confirm(second).expect("second released");
        assert_eq!(released[0].offset, 2);
        assert_eq!(tracker.pending(), 1);

        let released = tracker.confirm(first).expect("first released");
        assert_eq!(released[0].offset, 1);
    }
}
