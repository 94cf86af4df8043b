use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the hurricane daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Message bus connection configuration.
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Legacy coordination service configuration.
    #[serde(default)]
    pub zookeeper: ZookeeperConfig,

    /// Derivation engine configuration.
    #[serde(default)]
    pub hurricane: HurricaneConfig,

    /// Tag configuration lookup service.
    #[serde(default)]
    pub lookup: LookupConfig,

    /// Log sink configuration.
    #[serde(default)]
    pub log: LogConfig,

    /// Instance identity and operational metrics.
    #[serde(default)]
    pub misc: MiscConfig,
}

/// Message bus connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap broker list (host:port).
    #[serde(default)]
    pub brokers: Vec<String>,

    /// Topic carrying raw telemetry counters.
    #[serde(default)]
    pub consumer_topic: String,

    /// Consumer group id. Default: "hurricane".
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Topic receiving derived metrics.
    #[serde(default)]
    pub producer_topic: String,

    /// Transport keepalive in milliseconds. 0 selects the 3s default.
    #[serde(default)]
    pub keepalive_ms: u64,

    /// Persistence confidence required from the producer.
    #[serde(default)]
    pub producer_response_strategy: ResponseStrategy,

    /// Produce retries before a delivery is failed. 0 selects the default of 3.
    #[serde(default)]
    pub producer_retry: u32,
}

/// How much broker confirmation a produce request waits for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ResponseStrategy {
    NoResponse,
    #[default]
    WaitForLocal,
    WaitForAll,
}

impl From<String> for ResponseStrategy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "NoResponse" => ResponseStrategy::NoResponse,
            "WaitForAll" => ResponseStrategy::WaitForAll,
            // Unrecognized strategies fall back to local confirmation.
            _ => ResponseStrategy::WaitForLocal,
        }
    }
}

impl ResponseStrategy {
    /// librdkafka `request.required.acks` value.
    pub fn required_acks(self) -> &'static str {
        match self {
            ResponseStrategy::NoResponse => "0",
            ResponseStrategy::WaitForLocal => "1",
            ResponseStrategy::WaitForAll => "all",
        }
    }
}

/// Legacy coordination service configuration. Recognized for deployments
/// that still template it; broker discovery uses `kafka.brokers`.
#[derive(Debug, Default, Deserialize)]
pub struct ZookeeperConfig {
    /// Connection string (host:port[,host:port]/chroot).
    #[serde(default)]
    pub connect: String,
}

/// Derivation engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HurricaneConfig {
    /// Bounded input queue depth per worker. Default: 16.
    #[serde(default = "default_handler_queue_length")]
    pub handler_queue_length: usize,

    /// Derive cpu.usage.percent. Default: true.
    #[serde(default = "default_true")]
    pub derive_cpu: bool,

    /// Derive ctx.per.second. Default: true.
    #[serde(default = "default_true")]
    pub derive_ctx: bool,

    /// Derive memory.usage.percent. Default: true.
    #[serde(default = "default_true")]
    pub derive_mem: bool,

    /// Derive per-mountpoint disk metrics. Default: true.
    #[serde(default = "default_true")]
    pub derive_disk: bool,
}

/// Tag configuration lookup service.
#[derive(Debug, Clone, Deserialize)]
pub struct LookupConfig {
    /// Lookup service HTTP endpoint (e.g. "http://localhost:9100").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 5s.
    #[serde(default = "default_lookup_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Log sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log directory. Empty logs to stderr.
    #[serde(default)]
    pub path: String,

    /// Log file name within `path`. Default: "hurricane.log".
    #[serde(default = "default_log_file")]
    pub file: String,

    /// Reopen the log file on SIGUSR2 (external rotation). Default: false.
    #[serde(default)]
    pub rotate: bool,

    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Instance identity and operational metrics.
#[derive(Debug, Clone, Deserialize)]
pub struct MiscConfig {
    /// Distinguishes multiple instances in metrics and heartbeats.
    #[serde(default)]
    pub instance_name: String,

    /// Serve operational metrics over HTTP. Default: false.
    #[serde(default)]
    pub produce_metrics: bool,

    /// Metrics listen address. Default: "127.0.0.1:9090".
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: String,
}

// --- Default value functions ---

fn default_consumer_group() -> String {
    "hurricane".to_string()
}

fn default_handler_queue_length() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_lookup_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_log_file() -> String {
    "hurricane.log".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig::default(),
            zookeeper: ZookeeperConfig::default(),
            hurricane: HurricaneConfig::default(),
            lookup: LookupConfig::default(),
            log: LogConfig::default(),
            misc: MiscConfig::default(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            consumer_topic: String::new(),
            consumer_group: default_consumer_group(),
            producer_topic: String::new(),
            keepalive_ms: 0,
            producer_response_strategy: ResponseStrategy::default(),
            producer_retry: 0,
        }
    }
}

impl Default for HurricaneConfig {
    fn default() -> Self {
        Self {
            handler_queue_length: default_handler_queue_length(),
            derive_cpu: true,
            derive_ctx: true,
            derive_mem: true,
            derive_disk: true,
        }
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_lookup_timeout(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            file: default_log_file(),
            rotate: false,
            level: default_log_level(),
        }
    }
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            instance_name: String::new(),
            produce_metrics: false,
            metrics_listen: default_metrics_listen(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.is_empty() {
            bail!("kafka.brokers is required");
        }

        if self.kafka.consumer_topic.is_empty() {
            bail!("kafka.consumer_topic is required");
        }

        if self.kafka.producer_topic.is_empty() {
            bail!("kafka.producer_topic is required");
        }

        if self.lookup.endpoint.is_empty() {
            bail!("lookup.endpoint is required");
        }

        if self.hurricane.handler_queue_length == 0 {
            bail!("hurricane.handler_queue_length must be positive");
        }

        Ok(())
    }

    /// Instance identity used in heartbeats and the metrics prefix:
    /// `hurricane` or `hurricane/<instance>`.
    pub fn instance(&self) -> String {
        if self.misc.instance_name.is_empty() {
            "hurricane".to_string()
        } else {
            format!("hurricane/{}", self.misc.instance_name)
        }
    }
}

impl KafkaConfig {
    /// Effective transport keepalive.
    pub fn keepalive(&self) -> Duration {
        match self.keepalive_ms {
            0 => Duration::from_secs(3),
            ms => Duration::from_millis(ms),
        }
    }

    /// Effective produce retry count.
    pub fn retries(&self) -> u32 {
        match self.producer_retry {
            0 => 3,
            n => n,
        }
    }

    /// Comma-joined bootstrap server list for librdkafka.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> Config {
        Config {
            kafka: KafkaConfig {
                brokers: vec!["localhost:9092".to_string()],
                consumer_topic: "metrics.raw".to_string(),
                producer_topic: "metrics.derived".to_string(),
                ..Default::default()
            },
            lookup: LookupConfig {
                endpoint: "http://localhost:9100".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.kafka.consumer_group, "hurricane");
        assert_eq!(cfg.kafka.keepalive(), Duration::from_secs(3));
        assert_eq!(cfg.kafka.retries(), 3);
        assert_eq!(cfg.hurricane.handler_queue_length, 16);
        assert!(cfg.hurricane.derive_cpu);
        assert!(cfg.hurricane.derive_disk);
        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.misc.metrics_listen, "127.0.0.1:9090");
    }

    #[test]
    fn test_keepalive_override() {
        let cfg = KafkaConfig {
            keepalive_ms: 250,
            ..Default::default()
        };
        assert_eq!(cfg.keepalive(), Duration::from_millis(250));
    }

    #[test]
    fn test_response_strategy_parse_and_fallback() {
        assert_eq!(
            ResponseStrategy::from("NoResponse".to_string()),
            ResponseStrategy::NoResponse
        );
        assert_eq!(
            ResponseStrategy::from("WaitForAll".to_string()),
            ResponseStrategy::WaitForAll
        );
        assert_eq!(
            ResponseStrategy::from("FireAndPray".to_string()),
            ResponseStrategy::WaitForLocal
        );
        assert_eq!(ResponseStrategy::NoResponse.required_acks(), "0");
        assert_eq!(ResponseStrategy::WaitForLocal.required_acks(), "1");
        assert_eq!(ResponseStrategy::WaitForAll.required_acks(), "all");
    }

    #[test]
    fn test_validation_missing_brokers() {
        let mut cfg = valid_config();
        cfg.kafka.brokers.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("kafka.brokers"));
    }

    #[test]
    fn test_validation_missing_topics() {
        let mut cfg = valid_config();
        cfg.kafka.producer_topic.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("producer_topic"));
    }

    #[test]
    fn test_validation_zero_queue_length() {
        let mut cfg = valid_config();
        cfg.hurricane.handler_queue_length = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("handler_queue_length"));
    }

    #[test]
    fn test_instance_prefix() {
        let mut cfg = valid_config();
        assert_eq!(cfg.instance(), "hurricane");
        cfg.misc.instance_name = "lab".to_string();
        assert_eq!(cfg.instance(), "hurricane/lab");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"
kafka:
  brokers: ["broker-1:9092", "broker-2:9092"]
  consumer_topic: metrics.raw
  producer_topic: metrics.derived
  producer_response_strategy: WaitForAll
  producer_retry: 5
hurricane:
  handler_queue_length: 64
  derive_disk: false
lookup:
  endpoint: http://lookup:9100
  timeout: 2s
misc:
  instance_name: staging
  produce_metrics: true
"#
        )
        .expect("write");

        let cfg = Config::load(file.path()).expect("load");
        assert_eq!(cfg.kafka.brokers.len(), 2);
        assert_eq!(
            cfg.kafka.producer_response_strategy,
            ResponseStrategy::WaitForAll
        );
        assert_eq!(cfg.kafka.retries(), 5);
        assert_eq!(cfg.hurricane.handler_queue_length, 64);
        assert!(!cfg.hurricane.derive_disk);
        assert!(cfg.hurricane.derive_cpu);
        assert_eq!(cfg.lookup.timeout, Duration::from_secs(2));
        assert_eq!(cfg.instance(), "hurricane/staging");
        assert_eq!(cfg.kafka.bootstrap_servers(), "broker-1:9092,broker-2:9092");
    }
}
