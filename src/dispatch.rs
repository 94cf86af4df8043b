use anyhow::{anyhow, Result};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::bus::{is_heartbeat, Transport};
use crate::wire::peek_asset_id;

/// Body of a bus liveness beacon.
#[derive(Debug, Deserialize)]
struct HeartbeatEnvelope {
    heartbeat: HeartbeatBody,
}

#[derive(Debug, Deserialize)]
struct HeartbeatBody {
    #[serde(default)]
    host: i64,
}

/// Reads the routing host id from a raw message body.
///
/// Metric records carry the asset id as their first array element;
/// heartbeats carry it in the envelope.
pub fn peek_host(payload: &[u8]) -> Result<i64> {
    if is_heartbeat(payload) {
        let envelope: HeartbeatEnvelope = serde_json::from_slice(payload)?;
        return Ok(envelope.heartbeat.host);
    }

    Ok(peek_asset_id(payload)?)
}

/// Routes raw input messages to workers by asset hash.
///
/// All messages from one host land on one worker, which makes that worker
/// the single writer for every derivation state of that host's assets.
pub struct Dispatcher {
    inputs: Vec<mpsc::Sender<Transport>>,
}

impl Dispatcher {
    pub fn new(inputs: Vec<mpsc::Sender<Transport>>) -> Self {
        Self { inputs }
    }

    pub fn worker_count(&self) -> usize {
        self.inputs.len()
    }

    /// Index of the worker owning `host_id`.
    pub fn route(&self, host_id: i64) -> usize {
        host_id.rem_euclid(self.inputs.len() as i64) as usize
    }

    /// Enqueues `transport` on its worker's bounded input queue. Blocks
    /// when the queue is full, backpressuring the consumer.
    pub async fn dispatch(&self, transport: Transport) -> Result<()> {
        let idx = self.route(transport.host_id);
        self.inputs[idx]
            .send(transport)
            .await
            .map_err(|_| anyhow!("worker {idx} input queue closed"))
    }
}
