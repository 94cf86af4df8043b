//! Memory usage derivation: `memory.usage.percent`.
//!
//! Usage is an absolute reading of the completing cycle; the percentage is
//! computed in rational arithmetic and only converted to a float at fixed
//! two-decimal precision.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use num::rational::Ratio;

use crate::bus::Transport;
use crate::lookup::{Lookup, LookupError};
use crate::rounding::ratio_round;
use crate::wire::MetricRecord;

use super::{annotate, Emission};

pub const PATHS: &[&str] = &[
    "/sys/memory/active",
    "/sys/memory/buffers",
    "/sys/memory/cached",
    "/sys/memory/free",
    "/sys/memory/inactive",
    "/sys/memory/swapfree",
    "/sys/memory/swaptotal",
    "/sys/memory/total",
];

/// Per-asset memory cycle states.
pub struct Deriver {
    data: HashMap<i64, MemState>,
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
        let state = self.data.entry(sample.asset_id).or_default();
        state.update(sample, transport, &self.lookup).await
    }
}

#[derive(Debug, Default, Clone)]
struct Distribution {
    set_active: bool,
    set_buffers: bool,
    set_cached: bool,
    set_free: bool,
    set_inactive: bool,
    set_swap_free: bool,
    set_swap_total: bool,
    set_total: bool,
    active: i64,
    buffers: i64,
    cached: i64,
    free: i64,
    inactive: i64,
    swap_free: i64,
    swap_total: i64,
    total: i64,
}

impl Distribution {
    fn record(&mut self, path: &str, value: i64) {
        match path {
            "/sys/memory/active" => {
                self.active = value;
                self.set_active = true;
            }
            "/sys/memory/buffers" => {
                self.buffers = value;
                self.set_buffers = true;
            }
            "/sys/memory/cached" => {
                self.cached = value;
                self.set_cached = true;
            }
            "/sys/memory/free" => {
                self.free = value;
                self.set_free = true;
            }
            "/sys/memory/inactive" => {
                self.inactive = value;
                self.set_inactive = true;
            }
            "/sys/memory/swapfree" => {
                self.swap_free = value;
                self.set_swap_free = true;
            }
            "/sys/memory/swaptotal" => {
                self.swap_total = value;
                self.set_swap_total = true;
            }
            "/sys/memory/total" => {
                self.total = value;
                self.set_total = true;
            }
            _ => {}
        }
    }

    fn valid(&self) -> bool {
        self.set_active
            && self.set_buffers
            && self.set_cached
            && self.set_free
            && self.set_inactive
            && self.set_swap_free
            && self.set_swap_total
            && self.set_total
    }
}

#[derive(Default)]
pub(crate) struct MemState {
    asset_id: i64,
    curr: Distribution,
    next: Distribution,
    curr_time: Option<DateTime<Utc>>,
    next_time: Option<DateTime<Utc>>,
    usage: f64,
    pending: Vec<Transport>,
}

impl MemState {
    pub(crate) async fn update(
        &mut self,
        sample: &MetricRecord,
        transport: Transport,
        lookup: &Lookup,
    ) -> Result<Option<Emission>, LookupError> {
        if self.asset_id == 0 {
            self.asset_id = sample.asset_id;
        }

        if self.asset_id != sample.asset_id {
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

            self.next.record(&sample.path, value);
            break;
        }

        self.pending.push(transport);
        self.calculate(lookup).await
    }

    async fn calculate(&mut self, lookup: &Lookup) -> Result<Option<Emission>, LookupError> {
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
        if self.curr_time.is_none() {
            self.advance();
            return Ok(None);
        }

        // a host reporting no memory cannot produce a usage percentage
        if self.next.total == 0 {
            self.advance();
            return Ok(None);
        }

        let used = Ratio::from_integer(100i128)
            - Ratio::new(self.next.free as i128, self.next.total as i128)
                * Ratio::from_integer(100);
        self.usage = ratio_round(used, 2);

        self.advance();

        let derived = self.emit(next_time, lookup).await?;
        let acks = std::mem::take(&mut self.pending);
        Ok(Some(Emission { derived, acks }))
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
        let mut usage = MetricRecord::real(
            self.asset_id,
            "memory.usage.percent",
            timestamp,
            "%",
            self.usage,
        );
        annotate(lookup, &mut usage).await?;
        Ok(vec![usage])
    }
}
