//! Network interface derivation, per interface (paths suffixed `:<intf>`):
//! byte and packet rates, average packet sizes, and — for recognized link
//! speeds — bandwidth/packet-rate utilization percentages.
//!
//! The link speed sample is stored on the state rather than in the cycle
//! distribution; no output is produced until a nonzero speed is known.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use num::rational::Ratio;

use crate::bus::Transport;
use crate::lookup::{Lookup, LookupError};
use crate::rounding::{ratio_round, round_half_up};
use crate::wire::MetricRecord;

use super::{annotate, Emission};

pub const PATHS: &[&str] = &[
    "/sys/net/tx_bytes",
    "/sys/net/tx_packets",
    "/sys/net/rx_bytes",
    "/sys/net/rx_packets",
    "/sys/net/speed",
];

const BITS_PER_BYTE: i64 = 8;

/// Ethernet saturation limits for a link speed in Mbit: maximum bits per
/// second and maximum frames per second (64-byte minimum frame size).
fn link_attributes(speed: i64) -> Option<(i64, i64)> {
    match speed {
        10 => Some((10_000_000, 14_880)),
        100 => Some((100_000_000, 148_809)),
        1000 => Some((1_000_000_000, 1_488_096)),
        10000 => Some((10_000_000_000, 14_880_952)),
        _ => None,
    }
}

/// Per-asset, per-interface network cycle states.
pub struct Deriver {
    data: HashMap<i64, HashMap<String, NetIfState>>,
    lookup: Arc<Lookup>,
}

impl Deriver {
    pub fn new(lookup: Arc<Lookup>) -> Self {
        Self {
            data: HashMap::new(),
            lookup,
        }
    }

    pub async fn update(
        &mut self,
        sample: &MetricRecord,
        transport: Transport,
    ) -> Result<Option<Emission>, LookupError> {
        // valid network samples carry their interface as tag 0
        let Some(interface) = sample.tags.first() else {
            return Ok(Some(Emission::ack_only(transport)));
        };

        let state = self
            .data
            .entry(sample.asset_id)
            .or_default()
            .entry(interface.clone())
            .or_default();

        state.update(sample, transport, &self.lookup).await
    }
}

#[derive(Debug, Default, Clone)]
struct Distribution {
    set_rx_bytes: bool,
    set_rx_packets: bool,
    set_tx_bytes: bool,
    set_tx_packets: bool,
    rx_bytes: i64,
    rx_packets: i64,
    tx_bytes: i64,
    tx_packets: i64,
}

impl Distribution {
    fn valid(&self) -> bool {
        self.set_rx_bytes && self.set_rx_packets && self.set_tx_bytes && self.set_tx_packets
    }
}

#[derive(Default)]
pub(crate) struct NetIfState {
    asset_id: i64,
    interface: String,
    curr: Distribution,
    next: Distribution,
    curr_time: Option<DateTime<Utc>>,
    next_time: Option<DateTime<Utc>>,
    speed: i64,
    rx_bps: f64,
    tx_bps: f64,
    rx_pps: f64,
    tx_pps: f64,
    rx_size: i64,
    tx_size: i64,
    rx_utilization_bps: f64,
    tx_utilization_bps: f64,
    rx_utilization_pps: f64,
    tx_utilization_pps: f64,
    utilization: f64,
    pending: Vec<Transport>,
}

impl NetIfState {
    pub(crate) async fn update(
        &mut self,
        sample: &MetricRecord,
        transport: Transport,
        lookup: &Lookup,
    ) -> Result<Option<Emission>, LookupError> {
        if self.asset_id == 0 {
            self.asset_id = sample.asset_id;
        }
        if self.interface.is_empty() {
            if let Some(interface) = sample.tags.first() {
                self.interface = interface.clone();
            }
        }

        if self.asset_id != sample.asset_id {
            return Ok(Some(Emission::ack_only(transport)));
        }
        if sample.tags.first() != Some(&self.interface) {
            return Ok(Some(Emission::ack_only(transport)));
        }

        let Some(value) = sample.value.as_i64() else {
            return Ok(Some(Emission::ack_only(transport)));
        };

        loop {
            let next = match self.next_time {
                None => {
                    self.next_time = Some(sample.timestamp);
                    sample.timestamp
                }
                Some(t) => t,
            };

            if next > sample.timestamp {
                return Ok(Some(Emission::ack_only(transport)));
            }

            if next < sample.timestamp {
                self.next_time = None;
                self.next = Distribution::default();
                continue;
            }

            match sample.path.as_str() {
                "/sys/net/tx_bytes" => {
                    self.next.tx_bytes = value;
                    self.next.set_tx_bytes = true;
                }
                "/sys/net/rx_bytes" => {
                    self.next.rx_bytes = value;
                    self.next.set_rx_bytes = true;
                }
                "/sys/net/tx_packets" => {
                    self.next.tx_packets = value;
                    self.next.set_tx_packets = true;
                }
                "/sys/net/rx_packets" => {
                    self.next.rx_packets = value;
                    self.next.set_rx_packets = true;
                }
                // link speed lives on the state, not in the cycle
                "/sys/net/speed" => self.speed = value,
                _ => {}
            }
            break;
        }

        self.pending.push(transport);
        self.calculate(lookup).await
    }

    async fn calculate(&mut self, lookup: &Lookup) -> Result<Option<Emission>, LookupError> {
        // rates are meaningless until the link speed is known
        if self.speed == 0 {
            return Ok(None);
        }

        let next_time = match self.next_time {
            Some(t) if self.next.valid() => t,
            _ => return Ok(None),
        };

        if let Some(curr) = self.curr_time {
            if curr >= next_time {
                return Ok(None);
            }
        }

        // the first complete cycle only establishes the baseline
        let Some(curr_time) = self.curr_time else {
            self.advance();
            return Ok(None);
        };

        let delta = (next_time - curr_time).num_milliseconds() as f64 / 1000.0;
        if delta <= 0.0 {
            self.advance();
            return Ok(None);
        }

        let rx_bytes = self.next.rx_bytes - self.curr.rx_bytes;
        let tx_bytes = self.next.tx_bytes - self.curr.tx_bytes;
        let rx_packets = self.next.rx_packets - self.curr.rx_packets;
        let tx_packets = self.next.tx_packets - self.curr.tx_packets;

        // counter wrapped: re-baseline at the new values and skip one cycle
        if rx_bytes < 0 || tx_bytes < 0 || rx_packets < 0 || tx_packets < 0 {
            self.advance();
            return Ok(None);
        }

        self.rx_size = if rx_packets == 0 {
            0
        } else {
            (rx_bytes as f64 / rx_packets as f64) as i64
        };
        self.tx_size = if tx_packets == 0 {
            0
        } else {
            (tx_bytes as f64 / tx_packets as f64) as i64
        };

        self.rx_bps = rx_bytes as f64 / delta;
        self.tx_bps = tx_bytes as f64 / delta;
        self.rx_pps = rx_packets as f64 / delta;
        self.tx_pps = tx_packets as f64 / delta;

        // utilizations only for recognized link speeds, never for loopback
        if let Some((link_bps, link_fps)) = self.utilization_limits() {
            self.rx_utilization_bps = ratio_round(
                Ratio::new((self.rx_bps as i64 * BITS_PER_BYTE) as i128, link_bps as i128)
                    * Ratio::from_integer(100),
                2,
            );
            self.tx_utilization_bps = ratio_round(
                Ratio::new((self.tx_bps as i64 * BITS_PER_BYTE) as i128, link_bps as i128)
                    * Ratio::from_integer(100),
                2,
            );
            self.rx_utilization_pps = ratio_round(
                Ratio::new(self.rx_pps as i128, link_fps as i128) * Ratio::from_integer(100),
                2,
            );
            self.tx_utilization_pps = ratio_round(
                Ratio::new(self.tx_pps as i128, link_fps as i128) * Ratio::from_integer(100),
                2,
            );
            self.utilization = self
                .rx_utilization_bps
                .max(self.tx_utilization_bps)
                .max(self.rx_utilization_pps)
                .max(self.tx_utilization_pps);
        }

        self.rx_bps = round_half_up(self.rx_bps, 2);
        self.tx_bps = round_half_up(self.tx_bps, 2);
        self.rx_pps = round_half_up(self.rx_pps, 2);
        self.tx_pps = round_half_up(self.tx_pps, 2);

        self.advance();

        let derived = self.emit(next_time, lookup).await?;
        let acks = std::mem::take(&mut self.pending);
        Ok(Some(Emission { derived, acks }))
    }

    fn utilization_limits(&self) -> Option<(i64, i64)> {
        if self.interface == "lo" {
            return None;
        }
        link_attributes(self.speed)
    }

    fn advance(&mut self) {
        self.curr_time = self.next_time.take();
        self.curr = std::mem::take(&mut self.next);
    }

    async fn emit(
        &self,
        timestamp: DateTime<Utc>,
        lookup: &Lookup,
    ) -> Result<Vec<MetricRecord>, LookupError> {
        // per-second packet rates keep the legacy `Bps` unit label for
        // compatibility with downstream consumers
        let mut result = Vec::with_capacity(11);

        for (path, value) in [
            ("net.rx.bytes.per.second", self.rx_bps),
            ("net.tx.bytes.per.second", self.tx_bps),
            ("net.rx.packets.per.second", self.rx_pps),
            ("net.tx.packets.per.second", self.tx_pps),
        ] {
            let mut rec = MetricRecord::real(
                self.asset_id,
                format!("{path}:{}", self.interface),
                timestamp,
                "Bps",
                value,
            );
            annotate(lookup, &mut rec).await?;
            result.push(rec);
        }

        for (path, value) in [
            ("net.rx.average.packet.size.bytes", self.rx_size),
            ("net.tx.average.packet.size.bytes", self.tx_size),
        ] {
            let mut rec = MetricRecord::integer(
                self.asset_id,
                format!("{path}:{}", self.interface),
                timestamp,
                "B",
                value,
            );
            annotate(lookup, &mut rec).await?;
            result.push(rec);
        }

        if self.utilization_limits().is_none() {
            return Ok(result);
        }

        for (path, value) in [
            ("net.rx.bandwidth.utilization.percent", self.rx_utilization_bps),
            ("net.tx.bandwidth.utilization.percent", self.tx_utilization_bps),
            ("net.rx.packet.rate.utilization.percent", self.rx_utilization_pps),
            ("net.tx.packet.rate.utilization.percent", self.tx_utilization_pps),
            ("net.utilization.percent", self.utilization),
        ] {
            let mut rec = MetricRecord::real(
                self.asset_id,
                format!("{path}:{}", self.interface),
                timestamp,
                "%",
                value,
            );
            annotate(lookup, &mut rec).await?;
            result.push(rec);
        }

        Ok(result)
    }
}
