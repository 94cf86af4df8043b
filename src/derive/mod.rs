//! Derivation engine: per-asset state machines that assemble measurement
//! cycles from raw counters and compute rate/usage metrics between
//! consecutive cycles.

pub mod cpu;
pub mod ctx;
pub mod disk;
pub mod mem;
pub mod netif;

use std::collections::HashMap;
use std::sync::Arc;

use crate::bus::Transport;
use crate::config::HurricaneConfig;
use crate::lookup::{Lookup, LookupError};
use crate::wire::MetricRecord;

/// Result of a cycle completing (or an input being rejected).
///
/// `derived` holds the metrics to produce; `acks` the input transports
/// whose offsets may advance once every derived record is confirmed.
/// An ack-only emission (empty `derived`) commits immediately.
#[derive(Debug, Default)]
pub struct Emission {
    pub derived: Vec<MetricRecord>,
    pub acks: Vec<Transport>,
}

impl Emission {
    /// Rejection response: no output, acknowledge this one transport.
    pub fn ack_only(transport: Transport) -> Self {
        Self {
            derived: Vec::new(),
            acks: vec![transport],
        }
    }
}

/// Attaches the configured tags to a derived record.
///
/// An unconfigured path stays untagged; any other lookup failure aborts
/// the emission so no potentially mislabeled metric leaves the process.
pub(crate) async fn annotate(
    lookup: &Lookup,
    record: &mut MetricRecord,
) -> Result<(), LookupError> {
    match lookup.tags_for(record.asset_id, &record.path).await {
        Ok(tags) => {
            record.tags = tags;
            Ok(())
        }
        Err(LookupError::Unconfigured) => Ok(()),
        Err(e) => Err(e),
    }
}

/// One metric family's deriver. Enum dispatch keeps the per-message hot
/// path at a single map lookup plus a match.
pub enum Deriver {
    Cpu(cpu::Deriver),
    Ctx(ctx::Deriver),
    Mem(mem::Deriver),
    Disk(disk::Deriver),
    NetIf(netif::Deriver),
}

impl Deriver {
    /// Returns the family name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cpu(_) => "cpu",
            Self::Ctx(_) => "ctx",
            Self::Mem(_) => "mem",
            Self::Disk(_) => "disk",
            Self::NetIf(_) => "netif",
        }
    }

    /// Input paths this family consumes.
    pub fn paths(&self) -> &'static [&'static str] {
        match self {
            Self::Cpu(_) => cpu::PATHS,
            Self::Ctx(_) => ctx::PATHS,
            Self::Mem(_) => mem::PATHS,
            Self::Disk(_) => disk::PATHS,
            Self::NetIf(_) => netif::PATHS,
        }
    }

    /// Feeds one input sample into the family's per-asset state.
    pub async fn update(
        &mut self,
        sample: &MetricRecord,
        transport: Transport,
    ) -> Result<Option<Emission>, LookupError> {
        match self {
            Self::Cpu(d) => d.update(sample, transport).await,
            Self::Ctx(d) => d.update(sample, transport).await,
            Self::Mem(d) => d.update(sample, transport).await,
            Self::Disk(d) => d.update(sample, transport).await,
            Self::NetIf(d) => d.update(sample, transport).await,
        }
    }
}

/// Outcome of routing one input sample through the registry.
pub enum Routed {
    /// No family consumes this path; the transport comes back for an
    /// immediate commit.
    Unhandled(Transport),
    /// The sample was absorbed into a partial cycle.
    Buffered,
    /// A cycle completed (or the sample was rejected ack-only).
    Emitted(Emission),
}

/// Flat mapping from input path to the deriver that consumes it,
/// populated once at worker startup.
#[derive(Default)]
pub struct Registry {
    derivers: Vec<Deriver>,
    by_path: HashMap<&'static str, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry for one worker from the configured family flags.
    /// Network interface derivation is always bound.
    pub fn from_config(cfg: &HurricaneConfig, lookup: &Arc<Lookup>) -> Self {
        let mut registry = Self::new();

        if cfg.derive_ctx {
            registry.bind(Deriver::Ctx(ctx::Deriver::new(Arc::clone(lookup))));
        }
        if cfg.derive_cpu {
            registry.bind(Deriver::Cpu(cpu::Deriver::new(Arc::clone(lookup))));
        }
        if cfg.derive_mem {
            registry.bind(Deriver::Mem(mem::Deriver::new(Arc::clone(lookup))));
        }
        if cfg.derive_disk {
            registry.bind(Deriver::Disk(disk::Deriver::new(Arc::clone(lookup))));
        }
        registry.bind(Deriver::NetIf(netif::Deriver::new(Arc::clone(lookup))));

        registry
    }

    /// Registers a deriver for all of its input paths.
    pub fn bind(&mut self, deriver: Deriver) {
        let idx = self.derivers.len();
        for path in deriver.paths() {
            self.by_path.insert(path, idx);
        }
        self.derivers.push(deriver);
    }

    /// Returns the deriver consuming `path`, if any family is interested.
    pub fn get_mut(&mut self, path: &str) -> Option<&mut Deriver> {
        let idx = *self.by_path.get(path)?;
        self.derivers.get_mut(idx)
    }

    /// Routes one sample to the family consuming its path.
    pub async fn update(
        &mut self,
        sample: &MetricRecord,
        transport: Transport,
    ) -> Result<Routed, LookupError> {
        let Some(idx) = self.by_path.get(sample.path.as_str()).copied() else {
            return Ok(Routed::Unhandled(transport));
        };

        match self.derivers[idx].update(sample, transport).await? {
            Some(emission) => Ok(Routed::Emitted(emission)),
            None => Ok(Routed::Buffered),
        }
    }

    /// Number of bound families.
    pub fn len(&self) -> usize {
        self.derivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.derivers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup() -> Arc<Lookup> {
        Arc::new(Lookup::fixed(HashMap::new()))
    }

    #[test]
    fn test_registry_binds_all_families_by_default() {
        let registry = Registry::from_config(&HurricaneConfig::default(), &lookup());
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_registry_path_routing() {
        let mut registry = Registry::from_config(&HurricaneConfig::default(), &lookup());

        assert_eq!(
            registry.get_mut("/sys/cpu/count/idle").map(|d| d.name()),
            Some("cpu")
        );
        assert_eq!(registry.get_mut("/sys/cpu/ctx").map(|d| d.name()), Some("ctx"));
        assert_eq!(
            registry.get_mut("/sys/memory/total").map(|d| d.name()),
            Some("mem")
        );
        assert_eq!(
            registry.get_mut("/sys/disk/blk_read").map(|d| d.name()),
            Some("disk")
        );
        assert_eq!(
            registry.get_mut("/sys/net/speed").map(|d| d.name()),
            Some("netif")
        );
        assert!(registry.get_mut("/sys/load/1min").is_none());
    }

    #[test]
    fn test_registry_respects_family_flags() {
        let cfg = HurricaneConfig {
            derive_cpu: false,
            derive_disk: false,
            ..Default::default()
        };
        let mut registry = Registry::from_config(&cfg, &lookup());

        assert!(registry.get_mut("/sys/cpu/count/idle").is_none());
        assert!(registry.get_mut("/sys/disk/blk_read").is_none());
        // ctx and netif remain bound
        assert!(registry.get_mut("/sys/cpu/ctx").is_some());
        assert!(registry.get_mut("/sys/net/rx_bytes").is_some());
    }
}
