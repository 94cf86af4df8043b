//! CPU usage derivation: `cpu.usage.percent`.
//!
//! Seven scheduler-time counters sharing one timestamp form a cycle; usage
//! is the non-idle share of the counter movement between two consecutive
//! cycles.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::bus::Transport;
use crate::lookup::{Lookup, LookupError};
use crate::rounding::round_half_up;
use crate::wire::MetricRecord;

use super::{annotate, Emission};

pub const PATHS: &[&str] = &[
    "/sys/cpu/count/idle",
    "/sys/cpu/count/iowait",
    "/sys/cpu/count/irq",
    "/sys/cpu/count/nice",
    "/sys/cpu/count/softirq",
    "/sys/cpu/count/system",
    "/sys/cpu/count/user",
];

/// Per-asset cpu cycle states.
pub struct Deriver {
    data: HashMap<i64, CpuState>,
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

/// Counter fields of one measurement cycle, with per-field presence bits.
#[derive(Debug, Default, Clone)]
struct Distribution {
    set_idle: bool,
    set_iowait: bool,
    set_irq: bool,
    set_nice: bool,
    set_softirq: bool,
    set_system: bool,
    set_user: bool,
    idle: i64,
    iowait: i64,
    irq: i64,
    nice: i64,
    softirq: i64,
    system: i64,
    user: i64,
}

impl Distribution {
    fn record(&mut self, path: &str, value: i64) {
        match path {
            "/sys/cpu/count/idle" => {
                self.idle = value;
                self.set_idle = true;
            }
            "/sys/cpu/count/iowait" => {
                self.iowait = value;
                self.set_iowait = true;
            }
            "/sys/cpu/count/irq" => {
                self.irq = value;
                self.set_irq = true;
            }
            "/sys/cpu/count/nice" => {
                self.nice = value;
                self.set_nice = true;
            }
            "/sys/cpu/count/softirq" => {
                self.softirq = value;
                self.set_softirq = true;
            }
            "/sys/cpu/count/system" => {
                self.system = value;
                self.set_system = true;
            }
            "/sys/cpu/count/user" => {
                self.user = value;
                self.set_user = true;
            }
            _ => {}
        }
    }

    fn valid(&self) -> bool {
        self.set_idle
            && self.set_iowait
            && self.set_irq
            && self.set_nice
            && self.set_softirq
            && self.set_system
            && self.set_user
    }

    fn idle_total(&self) -> i64 {
        self.idle + self.iowait
    }

    fn nonidle_total(&self) -> i64 {
        self.user + self.nice + self.system + self.irq + self.softirq
    }
}

/// Cycle assembly and usage computation for one asset.
#[derive(Default)]
pub(crate) struct CpuState {
    asset_id: i64,
    curr: Distribution,
    next: Distribution,
    curr_time: Option<DateTime<Utc>>,
    next_time: Option<DateTime<Utc>>,
    idle: i64,
    total: i64,
    usage: f64,
    pending: Vec<Transport>,
}

impl CpuState {
    pub(crate) async fn update(
        &mut self,
        sample: &MetricRecord,
        transport: Transport,
        lookup: &Lookup,
    ) -> Result<Option<Emission>, LookupError> {
        if self.asset_id == 0 {
            self.asset_id = sample.asset_id;
        }

        // A sample for a different asset is acknowledged in isolation.
        if self.asset_id != sample.asset_id {
            return Ok(Some(Emission::ack_only(transport)));
        }

        // Only aggregate counters tagged `cpu`; per-core samples (cpu0,
        // cpu1, ...) are acknowledged without processing.
        if !sample.tags.iter().any(|t| t == "cpu") {
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

            // out of order sample for an old timestamp
            if next > sample.timestamp {
                return Ok(Some(Emission::ack_only(transport)));
            }

            // a newer timestamp abandons the partial cycle
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

        // do not walk backwards in time
        if let Some(curr) = self.curr_time {
            if curr >= next_time {
                return Ok(None);
            }
        }

        let next_idle = self.next.idle_total();
        let next_total = next_idle + self.next.nonidle_total();

        // the first complete cycle only establishes the baseline
        if self.curr_time.is_none() {
            self.idle = next_idle;
            self.total = next_total;
            self.advance();
            return Ok(None);
        }

        let total_delta = next_total - self.total;
        let idle_delta = next_idle - self.idle;
        self.usage = (total_delta - idle_delta) as f64 / total_delta as f64;
        self.usage = round_half_up(self.usage, 4) * 100.0;

        self.idle = next_idle;
        self.total = next_total;
        self.advance();

        let derived = self.emit(next_time, lookup).await?;
        let acks = std::mem::take(&mut self.pending);
        Ok(Some(Emission { derived, acks }))
    }

    /// Advances the cycle window by one step.
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
            "cpu.usage.percent",
            timestamp,
            "%",
            self.usage,
        );
        annotate(lookup, &mut usage).await?;
        Ok(vec![usage])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MetricValue;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    fn sample(asset_id: i64, path: &str, ts: DateTime<Utc>, value: i64) -> MetricRecord {
        let mut rec = MetricRecord::integer(asset_id, path, ts, "", value);
        rec.tags = vec!["cpu".to_string()];
        rec
    }

    fn transport(offset: i64) -> (Transport, mpsc::UnboundedReceiver<crate::bus::CommitAck>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Transport::new(Arc::from("raw"), 0, offset, 1, Vec::new(), tx),
            rx,
        )
    }

    fn ts(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 5, 25, 11, 4, sec).unwrap()
    }

    async fn feed_cycle(
        deriver: &mut Deriver,
        asset_id: i64,
        at: DateTime<Utc>,
        counters: [i64; 7],
    ) -> Option<Emission> {
        let mut last = None;
        for (path, value) in PATHS.iter().zip(counters) {
            let (t, _rx) = transport(0);
            last = deriver
                .update(&sample(asset_id, path, at, value), t)
                .await
                .expect("update");
        }
        last
    }

    #[tokio::test]
    async fn test_first_cycle_baseline_second_cycle_emits() {
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(HashMap::new())));

        // idle=60 iowait=0 irq=0 nice=0 softirq=0 system=10 user=10
        let first = feed_cycle(&mut deriver, 1, ts(1), [60, 0, 0, 0, 0, 10, 10]).await;
        assert!(first.is_none(), "baseline cycle must not emit");

        // idle=90: total delta 40, idle delta 30 -> usage 25%
        let emission = feed_cycle(&mut deriver, 1, ts(2), [90, 0, 0, 0, 0, 15, 15])
            .await
            .expect("second cycle emits");

        assert_eq!(emission.derived.len(), 1);
        let rec = &emission.derived[0];
        assert_eq!(rec.path, "cpu.usage.percent");
        assert_eq!(rec.unit, "%");
        assert_eq!(rec.timestamp, ts(2));
        assert_eq!(rec.value, MetricValue::Real(25.0));
        // both cycles' transports come back with the emission
        assert_eq!(emission.acks.len(), 14);
    }

    #[tokio::test]
    async fn test_usage_rounds_to_four_places() {
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(HashMap::new())));

        feed_cycle(&mut deriver, 1, ts(1), [60, 0, 0, 0, 0, 10, 10]).await;
        // total delta 30, idle delta 20 -> 10/30 = 0.33333... -> 33.33%
        let emission = feed_cycle(&mut deriver, 1, ts(2), [80, 0, 0, 0, 0, 15, 15])
            .await
            .expect("emits");

        let expected = round_half_up(10.0 / 30.0, 4) * 100.0;
        assert_eq!(emission.derived[0].value, MetricValue::Real(expected));
    }

    #[tokio::test]
    async fn test_foreign_asset_is_acked_in_isolation() {
        let lookup = Lookup::fixed(HashMap::new());
        let mut state = CpuState {
            asset_id: 5,
            ..Default::default()
        };

        let (t, mut rx) = transport(77);
        let emission = state
            .update(&sample(9, "/sys/cpu/count/idle", ts(1), 1), t, &lookup)
            .await
            .expect("update")
            .expect("ack-only emission");

        assert!(emission.derived.is_empty());
        assert_eq!(emission.acks.len(), 1);
        assert_eq!(state.asset_id, 5);
        assert!(state.next_time.is_none(), "state untouched");

        emission.acks[0].commit();
        assert_eq!(rx.try_recv().expect("ack").offset, 77);
    }

    #[tokio::test]
    async fn test_sample_without_cpu_tag_is_acked() {
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(HashMap::new())));
        let mut rec = MetricRecord::integer(1, "/sys/cpu/count/idle", ts(1), "", 10);
        rec.tags = vec!["cpu3".to_string()];

        let (t, _rx) = transport(0);
        let emission = deriver.update(&rec, t).await.expect("update").expect("ack");
        assert!(emission.derived.is_empty());
        assert_eq!(emission.acks.len(), 1);
    }

    #[tokio::test]
    async fn test_late_sample_is_acked_without_touching_cycle() {
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(HashMap::new())));

        let (t, _rx) = transport(0);
        deriver
            .update(&sample(1, "/sys/cpu/count/idle", ts(10), 100), t)
            .await
            .expect("update");

        let (t, _rx) = transport(0);
        let emission = deriver
            .update(&sample(1, "/sys/cpu/count/idle", ts(9), 90), t)
            .await
            .expect("update")
            .expect("ack-only");

        assert!(emission.derived.is_empty());
        assert_eq!(emission.acks.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_partial_cycle_carries_acks_forward() {
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(HashMap::new())));

        // two samples of a cycle that never completes
        for path in &PATHS[..2] {
            let (t, _rx) = transport(0);
            deriver
                .update(&sample(1, path, ts(1), 1), t)
                .await
                .expect("update");
        }

        // a newer timestamp abandons the partial cycle; baseline completes
        assert!(feed_cycle(&mut deriver, 1, ts(2), [60, 0, 0, 0, 0, 10, 10])
            .await
            .is_none());

        // second full cycle returns the stranded acks too: 2 + 7 + 7
        let emission = feed_cycle(&mut deriver, 1, ts(3), [80, 0, 0, 0, 0, 15, 15])
            .await
            .expect("emits");
        assert_eq!(emission.acks.len(), 16);
    }

    #[tokio::test]
    async fn test_reapplied_sample_is_idempotent_for_validity() {
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(HashMap::new())));

        feed_cycle(&mut deriver, 1, ts(1), [60, 0, 0, 0, 0, 10, 10]).await;

        // repeat one field of the next cycle before completing it
        let (t, _rx) = transport(0);
        deriver
            .update(&sample(1, "/sys/cpu/count/idle", ts(2), 70), t)
            .await
            .expect("update");
        let (t, _rx) = transport(0);
        assert!(deriver
            .update(&sample(1, "/sys/cpu/count/idle", ts(2), 80), t)
            .await
            .expect("update")
            .is_none());

        let emission = feed_cycle(&mut deriver, 1, ts(2), [80, 0, 0, 0, 0, 15, 15])
            .await
            .expect("emits");
        // overwrite kept the cycle consistent: idle delta 20, total delta 30
        let expected = round_half_up(10.0 / 30.0, 4) * 100.0;
        assert_eq!(emission.derived[0].value, MetricValue::Real(expected));
    }

    #[tokio::test]
    async fn test_emitted_record_carries_configured_tags() {
        let mut table = HashMap::new();
        table.insert(
            "1:cpu.usage.percent".to_string(),
            vec!["profile-7".to_string()],
        );
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(table)));

        feed_cycle(&mut deriver, 1, ts(1), [60, 0, 0, 0, 0, 10, 10]).await;
        let emission = feed_cycle(&mut deriver, 1, ts(2), [90, 0, 0, 0, 0, 15, 15])
            .await
            .expect("emits");

        assert_eq!(emission.derived[0].tags, vec!["profile-7".to_string()]);
    }
}
