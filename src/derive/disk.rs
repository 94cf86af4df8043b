//! Disk throughput and occupancy derivation, per mountpoint:
//! `disk.read.per.second`, `disk.write.per.second`, `disk.free`,
//! `disk.usage.percent` (paths suffixed `:<mountpoint>`).
//!
//! Occupancy counters arrive in 1 KiB blocks, transfer counters in 512 B
//! sectors; both are normalized to bytes on ingest.

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
    "/sys/disk/blk_total",
    "/sys/disk/blk_used",
    "/sys/disk/blk_read",
    "/sys/disk/blk_wrtn",
];

const BLOCK_BYTES: i64 = 1024;
const SECTOR_BYTES: i64 = 512;

/// Per-asset, per-mountpoint disk cycle states.
pub struct Deriver {
    data: HashMap<i64, HashMap<String, DiskState>>,
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
        // valid disk samples carry their mountpoint as tag 0
        let Some(mountpoint) = sample.tags.first() else {
            return Ok(Some(Emission::ack_only(transport)));
        };

        let state = self
            .data
            .entry(sample.asset_id)
            .or_default()
            .entry(mountpoint.clone())
            .or_default();

        state.update(sample, transport, &self.lookup).await
    }
}

#[derive(Debug, Default, Clone)]
struct Distribution {
    set_blk_total: bool,
    set_blk_used: bool,
    set_blk_read: bool,
    set_blk_write: bool,
    blk_total: i64,
    blk_used: i64,
    blk_read: i64,
    blk_write: i64,
}

impl Distribution {
    fn record(&mut self, path: &str, value: i64) {
        match path {
            "/sys/disk/blk_total" => {
                self.blk_total = value * BLOCK_BYTES;
                self.set_blk_total = true;
            }
            "/sys/disk/blk_used" => {
                self.blk_used = value * BLOCK_BYTES;
                self.set_blk_used = true;
            }
            "/sys/disk/blk_read" => {
                self.blk_read = value * SECTOR_BYTES;
                self.set_blk_read = true;
            }
            "/sys/disk/blk_wrtn" => {
                self.blk_write = value * SECTOR_BYTES;
                self.set_blk_write = true;
            }
            _ => {}
        }
    }

    fn valid(&self) -> bool {
        self.set_blk_total && self.set_blk_used && self.set_blk_read && self.set_blk_write
    }
}

#[derive(Default)]
pub(crate) struct DiskState {
    asset_id: i64,
    mountpoint: String,
    curr: Distribution,
    next: Distribution,
    curr_time: Option<DateTime<Utc>>,
    next_time: Option<DateTime<Utc>>,
    read_bps: f64,
    write_bps: f64,
    usage: f64,
    bytes_free: i64,
    pending: Vec<Transport>,
}

impl DiskState {
    pub(crate) async fn update(
        &mut self,
        sample: &MetricRecord,
        transport: Transport,
        lookup: &Lookup,
    ) -> Result<Option<Emission>, LookupError> {
        if self.asset_id == 0 {
            self.asset_id = sample.asset_id;
        }
        if self.mountpoint.is_empty() {
            if let Some(mountpoint) = sample.tags.first() {
                self.mountpoint = mountpoint.clone();
            }
        }

        if self.asset_id != sample.asset_id {
            return Ok(Some(Emission::ack_only(transport)));
        }
        if sample.tags.first() != Some(&self.mountpoint) {
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

        // a zero-size filesystem cannot produce occupancy metrics
        if self.next.blk_total == 0 {
            self.advance();
            return Ok(None);
        }

        // occupancy is an absolute reading of the completing cycle
        let usage = Ratio::new(self.next.blk_used as i128, self.next.blk_total as i128)
            * Ratio::from_integer(100);
        self.usage = ratio_round(usage, 2);
        self.bytes_free = self.next.blk_total - self.next.blk_used;

        // the first complete cycle only establishes the baseline
        let Some(curr_time) = self.curr_time else {
            self.advance();
            return Ok(None);
        };

        let delta = (next_time - curr_time).num_milliseconds() as f64 / 1000.0;

        let reads = self.next.blk_read - self.curr.blk_read;
        let writes = self.next.blk_write - self.curr.blk_write;

        // counter wrapped: re-baseline at the new values and skip one cycle
        if reads < 0 || writes < 0 {
            self.advance();
            return Ok(None);
        }

        self.read_bps = round_half_up(reads as f64 / delta, 2);
        self.write_bps = round_half_up(writes as f64 / delta, 2);

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
        let mut write_rate = MetricRecord::real(
            self.asset_id,
            format!("disk.write.per.second:{}", self.mountpoint),
            timestamp,
            "B",
            self.write_bps,
        );
        annotate(lookup, &mut write_rate).await?;

        let mut read_rate = MetricRecord::real(
            self.asset_id,
            format!("disk.read.per.second:{}", self.mountpoint),
            timestamp,
            "B",
            self.read_bps,
        );
        annotate(lookup, &mut read_rate).await?;

        let mut free = MetricRecord::integer(
            self.asset_id,
            format!("disk.free:{}", self.mountpoint),
            timestamp,
            "B",
            self.bytes_free,
        );
        annotate(lookup, &mut free).await?;

        let mut usage = MetricRecord::real(
            self.asset_id,
            format!("disk.usage.percent:{}", self.mountpoint),
            timestamp,
            "%",
            self.usage,
        );
        annotate(lookup, &mut usage).await?;

        Ok(vec![write_rate, read_rate, free, usage])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MetricValue;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    fn sample(asset_id: i64, path: &str, ts: DateTime<Utc>, value: i64, tag: &str) -> MetricRecord {
        let mut rec = MetricRecord::integer(asset_id, path, ts, "", value);
        rec.tags = vec![tag.to_string()];
        rec
    }

    fn transport() -> Transport {
        let (tx, _rx) = mpsc::unbounded_channel();
        Transport::new(Arc::from("raw"), 0, 0, 1, Vec::new(), tx)
    }

    fn ts(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 5, 25, 11, 4, sec).unwrap()
    }

    async fn feed_cycle(
        deriver: &mut Deriver,
        at: DateTime<Utc>,
        [total, used, read, written]: [i64; 4],
    ) -> Option<Emission> {
        let mut last = None;
        for (path, value) in PATHS.iter().zip([total, used, read, written]) {
            last = deriver
                .update(&sample(1, path, at, value, "/"), transport())
                .await
                .expect("update");
        }
        last
    }

    fn value_of<'a>(emission: &'a Emission, path: &str) -> &'a MetricValue {
        &emission
            .derived
            .iter()
            .find(|r| r.path == path)
            .unwrap_or_else(|| panic!("record {path} missing"))
            .value
    }

    #[tokio::test]
    async fn test_counter_wrap_rebaselines_and_skips_one_cycle() {
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(HashMap::new())));

        // baseline
        assert!(feed_cycle(&mut deriver, ts(1), [1048576, 524288, 1000, 2000])
            .await
            .is_none());

        // reads moved backwards: wrap detected, no output
        assert!(feed_cycle(&mut deriver, ts(2), [1048576, 524288, 500, 2000])
            .await
            .is_none());

        // rates resume against the fresh baseline
        let emission = feed_cycle(&mut deriver, ts(3), [1048576, 524288, 1500, 3000])
            .await
            .expect("emits");

        assert_eq!(emission.derived.len(), 4);
        assert_eq!(
            value_of(&emission, "disk.read.per.second:/"),
            &MetricValue::Real(512_000.0)
        );
        assert_eq!(
            value_of(&emission, "disk.write.per.second:/"),
            &MetricValue::Real(512_000.0)
        );
        assert_eq!(
            value_of(&emission, "disk.free:/"),
            &MetricValue::Int(524_288 * 1024)
        );
        assert_eq!(
            value_of(&emission, "disk.usage.percent:/"),
            &MetricValue::Real(50.0)
        );
        // acks from all three cycles drained together
        assert_eq!(emission.acks.len(), 12);
    }

    #[tokio::test]
    async fn test_rates_are_byte_scaled_per_second() {
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(HashMap::new())));

        feed_cycle(&mut deriver, ts(0), [1000, 100, 0, 0]).await;
        let emission = feed_cycle(&mut deriver, ts(2), [1000, 100, 100, 50])
            .await
            .expect("emits");

        // 100 sectors over 2s = 100*512/2
        assert_eq!(
            value_of(&emission, "disk.read.per.second:/"),
            &MetricValue::Real(25_600.0)
        );
        assert_eq!(
            value_of(&emission, "disk.write.per.second:/"),
            &MetricValue::Real(12_800.0)
        );
        assert_eq!(
            value_of(&emission, "disk.usage.percent:/"),
            &MetricValue::Real(10.0)
        );
    }

    #[tokio::test]
    async fn test_sample_without_mountpoint_tag_is_acked() {
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(HashMap::new())));

        let rec = MetricRecord::integer(1, "/sys/disk/blk_read", ts(1), "", 10);
        let emission = deriver
            .update(&rec, transport())
            .await
            .expect("update")
            .expect("ack-only");
        assert!(emission.derived.is_empty());
        assert_eq!(emission.acks.len(), 1);
    }

    #[tokio::test]
    async fn test_mountpoints_track_independent_cycles() {
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(HashMap::new())));

        for mountpoint in ["/", "/var"] {
            for (path, value) in PATHS.iter().zip([1000i64, 100, 0, 0]) {
                deriver
                    .update(&sample(1, path, ts(1), value, mountpoint), transport())
                    .await
                    .expect("update");
            }
        }

        // complete a second cycle only for /var
        let mut emission = None;
        for (path, value) in PATHS.iter().zip([1000i64, 200, 10, 10]) {
            emission = deriver
                .update(&sample(1, path, ts(2), value, "/var"), transport())
                .await
                .expect("update");
        }

        let emission = emission.expect("emits");
        assert!(emission.derived.iter().all(|r| r.path.ends_with(":/var")));
        assert_eq!(
            value_of(&emission, "disk.usage.percent:/var"),
            &MetricValue::Real(20.0)
        );
    }

    #[tokio::test]
    async fn test_no_negative_rate_is_ever_emitted() {
        let mut deriver = Deriver::new(Arc::new(Lookup::fixed(HashMap::new())));

        feed_cycle(&mut deriver, ts(1), [1000, 100, 500, 500]).await;

        // both counters wrap repeatedly; nothing may surface
        for (sec, read, written) in [(2, 400, 450), (3, 300, 350)] {
            let out = feed_cycle(&mut deriver, ts(sec), [1000, 100, read, written]).await;
            assert!(out.is_none(), "wrapped cycle must stay silent");
        }
    }
}
