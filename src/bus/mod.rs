pub mod consumer;
pub mod producer;

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Payload prefix the bus keepalive producer stamps on liveness beacons.
/// Heartbeats are forwarded to the lookup service and never enter the
/// derivation state machines.
pub const HEARTBEAT_PREFIX: &[u8] = b"{\"heartbeat\":";

/// Returns true if `payload` is a consumer-liveness beacon.
pub fn is_heartbeat(payload: &[u8]) -> bool {
    payload.starts_with(HEARTBEAT_PREFIX)
}

/// Consumer cursor advancement for one processed input message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAck {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// An input message plus the bus bookkeeping needed to commit it.
///
/// A Transport is owned by exactly one worker at a time; it moves into the
/// derivation state that buffered its sample and comes back out with the
/// cycle's emission.
#[derive(Debug, Clone)]
pub struct Transport {
    pub topic: Arc<str>,
    pub partition: i32,
    pub offset: i64,
    /// Asset id peeked from the payload; routing key for worker assignment.
    pub host_id: i64,
    pub payload: Vec<u8>,
    commit_tx: mpsc::UnboundedSender<CommitAck>,
}

impl Transport {
    pub fn new(
        topic: Arc<str>,
        partition: i32,
        offset: i64,
        host_id: i64,
        payload: Vec<u8>,
        commit_tx: mpsc::UnboundedSender<CommitAck>,
    ) -> Self {
        Self {
            topic,
            partition,
            offset,
            host_id,
            payload,
            commit_tx,
        }
    }

    /// Marks this message as fully processed. A closed committer during
    /// shutdown drops the ack; the bus redelivers after restart.
    pub fn commit(&self) {
        let _ = self.commit_tx.send(CommitAck {
            topic: self.topic.to_string(),
            partition: self.partition,
            offset: self.offset,
        });
    }

    /// Returns true if this message is a consumer-liveness beacon.
    pub fn is_heartbeat(&self) -> bool {
        is_heartbeat(&self.payload)
    }
}

/// Asynchronous confirmation from the derived-metrics producer.
#[derive(Debug)]
pub enum ProducerEvent {
    /// The broker accepted one message produced under this tracking id.
    Delivered(Uuid),
    /// A produce request failed terminally. `tracking` is None for
    /// client-level transport errors not tied to a single message.
    Failed {
        tracking: Option<Uuid>,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_detection() {
        assert!(is_heartbeat(br#"{"heartbeat":{"host":7}}"#));
        assert!(!is_heartbeat(br#"[7, "/sys/cpu/ctx", "2017-05-25T11:04:45Z", "integer", "", 1, [], null]"#));
        assert!(!is_heartbeat(b""));
    }

    #[test]
    fn test_transport_commit_sends_ack() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let t = Transport::new(Arc::from("metrics.raw"), 3, 1044, 7, Vec::new(), tx);
        t.commit();

        let ack = rx.try_recv().expect("ack queued");
        assert_eq!(
            ack,
            CommitAck {
                topic: "metrics.raw".to_string(),
                partition: 3,
                offset: 1044,
            }
        );
    }

    #[test]
    fn test_transport_commit_tolerates_closed_committer() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let t = Transport::new(Arc::from("metrics.raw"), 0, 1, 7, Vec::new(), tx);
        t.commit();
    }
}
