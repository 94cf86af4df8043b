//! Context switch rate derivation: `ctx.per.second`.
//!
//! A single counter path, so the "cycle" degenerates to one value per
//! timestamp and every in-order sample after the first completes a cycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::bus::Transport;
use crate::lookup::{Lookup, LookupError};
use crate::rounding::round_half_up;
use crate::wire::MetricRecord;

use super::{annotate, Emission};

pub const PATHS: &[&str] = &["/sys/cpu/ctx"];

/// Per-asset context switch counter states.
pub struct Deriver {
    data: HashMap<i64, CtxState>,
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

#[derive(Default)]
pub(crate) struct CtxState {
    asset_id: i64,
    curr_value: i64,
    next_value: i64,
    cps: f64,
    curr_time: Option<DateTime<Utc>>,
    next_time: Option<DateTime<Utc>>,
    pending: Vec<Transport>,
}

impl CtxState {
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

        let curr = match self.curr_time {
            // first sample establishes the baseline
            None => {
                self.curr_time = Some(sample.timestamp);
                self.curr_value = value;
                self.pending = vec![transport];
                return Ok(None);
            }
            Some(t) => t,
        };

        // backwards in time
        if curr >= sample.timestamp {
            return Ok(Some(Emission::ack_only(transport)));
        }

        self.next_time = Some(sample.timestamp);
        self.next_value = value;
        self.pending.push(transport);
        self.calculate(lookup).await
    }

    async fn calculate(&mut self, lookup: &Lookup) -> Result<Option<Emission>, LookupError> {
        let (Some(curr), Some(next)) = (self.curr_time, self.next_time) else {
            return Ok(None);
        };

        let switches = self.next_value - self.curr_value;
        let delta = (next - curr).num_milliseconds() as f64 / 1000.0;

        self.cps = switches as f64 / delta;
        self.cps = round_half_up(self.cps, 2);

        self.advance();

        let derived = self.emit(next, lookup).await?;
        let acks = std::mem::take(&mut self.pending);
        Ok(Some(Emission { derived, acks }))
    }

    fn advance(&mut self) {
        self.curr_value = self.next_value;
        self.curr_time = self.next_time.take();
        self.next_value = 0;
    }

    async fn emit(
        &self,
        timestamp: DateTime<Utc>,
        lookup: &Lookup,
    ) -> Result<Vec<MetricRecord>, LookupError> {
        let mut cps = MetricRecord::real(self.asset_id, "ctx.per.second", timestamp, "#", self.cps);
        annotate(lookup, &mut cps).await?;
        Ok(vec![cps])
    }
}
