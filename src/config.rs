use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Cluster membership as seen by this node.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Inter-node transport.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Stage queues and aggregation.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Persistence flush behaviour.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Name exchange retry behaviour.
    #[serde(default)]
    pub exchange: ExchangeConfig,

    /// Threshold alarms on service metrics.
    #[serde(default)]
    pub alarm: AlarmConfig,

    /// Retention of stored metric rows.
    #[serde(default)]
    pub ttl: TtlConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Cluster membership configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Address other nodes use to reach this node's remote endpoint.
    #[serde(default)]
    pub self_address: String,

    /// All cluster addresses including this node. Empty runs standalone.
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Points per node on the hash ring. Default: 160.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
}

/// Inter-node transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Listen address for remote messages and segment ingestion.
    /// Default: ":11800".
    #[serde(default = "default_remote_listen_addr")]
    pub listen_addr: String,

    /// Per-request timeout. Default: 5s.
    #[serde(default = "default_remote_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Body compression: "none" or "gzip". Default: "none".
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Messages per request. Default: 256.
    #[serde(default = "default_remote_batch_size")]
    pub batch_size: usize,
}

/// What a producer does when a stage queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicyKind {
    /// Drop the record immediately and count it.
    #[default]
    Drop,
    /// Wait up to `block_timeout`, then drop and count.
    Block,
}

/// Stage queue and aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Bounded inbound queue capacity per stage. Default: 1024.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Full-queue policy. Default: drop.
    #[serde(default)]
    pub queue_policy: QueuePolicyKind,

    /// Wait limit for the block policy. Default: 100ms.
    #[serde(default = "default_block_timeout", with = "humantime_serde")]
    pub block_timeout: Duration,

    /// Records with buckets older than this are late and dropped.
    /// Default: 10m.
    #[serde(default = "default_aggregation_window", with = "humantime_serde")]
    pub aggregation_window: Duration,
}

/// Persistence flush configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Flush tick period. Default: 3s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Rows per storage read/write call. Default: 2000.
    #[serde(default = "default_persistence_batch_size")]
    pub batch_size: usize,

    /// Time allowed for draining stage queues on shutdown. Default: 10s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Name exchange retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// Retry cycles before a segment is discarded. Default: 5.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Period of the retry cycle. Default: 1s.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Maximum segments waiting for retry. Default: 10000.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

/// Threshold alarm configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AlarmConfig {
    /// Evaluate alarms after service metric flushes. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Calls required in a minute before a service is assessed. Default: 10.
    #[serde(default = "default_min_calls")]
    pub min_calls: i64,

    /// Error ratio in (0, 1] that raises an error-rate alarm. Default: 0.5.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Average latency that raises a slow-response alarm. Default: 3s.
    #[serde(default = "default_avg_latency_threshold", with = "humantime_serde")]
    pub avg_latency_threshold: Duration,
}

/// Storage retention configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TtlConfig {
    /// Run the sweeper. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Age after which metric rows are deleted. Default: 7d.
    #[serde(default = "default_metric_retention", with = "humantime_serde")]
    pub metric_retention: Duration,

    /// Sweep period. Default: 1h.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_virtual_nodes() -> usize {
    160
}

fn default_remote_listen_addr() -> String {
    ":11800".to_string()
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_remote_batch_size() -> usize {
    256
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_block_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_aggregation_window() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_persistence_batch_size() -> usize {
    2000
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_pending() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_min_calls() -> i64 {
    10
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_avg_latency_threshold() -> Duration {
    Duration::from_secs(3)
}

fn default_metric_retention() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            cluster: ClusterConfig::default(),
            remote: RemoteConfig::default(),
            stream: StreamConfig::default(),
            persistence: PersistenceConfig::default(),
            exchange: ExchangeConfig::default(),
            alarm: AlarmConfig::default(),
            ttl: TtlConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            self_address: String::new(),
            nodes: Vec::new(),
            virtual_nodes: default_virtual_nodes(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_remote_listen_addr(),
            timeout: default_remote_timeout(),
            compression: default_compression(),
            batch_size: default_remote_batch_size(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            queue_policy: QueuePolicyKind::default(),
            block_timeout: default_block_timeout(),
            aggregation_window: default_aggregation_window(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            batch_size: default_persistence_batch_size(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval: default_retry_interval(),
            max_pending: default_max_pending(),
        }
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_calls: default_min_calls(),
            error_rate_threshold: default_error_rate_threshold(),
            avg_latency_threshold: default_avg_latency_threshold(),
        }
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metric_retention: default_metric_retention(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
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
        if self.cluster.self_address.is_empty() {
            bail!("cluster.self_address is required");
        }

        if !self.cluster.nodes.is_empty()
            && !self.cluster.nodes.contains(&self.cluster.self_address)
        {
            bail!(
                "cluster.self_address {} must be listed in cluster.nodes",
                self.cluster.self_address
            );
        }

        if self.cluster.virtual_nodes == 0 {
            bail!("cluster.virtual_nodes must be positive");
        }

        if !matches!(self.remote.compression.as_str(), "none" | "gzip") {
            bail!(
                "remote.compression must be one of none, gzip (got {:?})",
                self.remote.compression
            );
        }

        if self.remote.batch_size == 0 {
            bail!("remote.batch_size must be positive");
        }

        if self.remote.timeout.is_zero() {
            bail!("remote.timeout must be positive");
        }

        if self.stream.queue_capacity == 0 {
            bail!("stream.queue_capacity must be positive");
        }

        if self.stream.queue_policy == QueuePolicyKind::Block && self.stream.block_timeout.is_zero()
        {
            bail!("stream.block_timeout must be positive with the block policy");
        }

        if self.stream.aggregation_window.is_zero() {
            bail!("stream.aggregation_window must be positive");
        }

        if self.persistence.flush_interval.is_zero() {
            bail!("persistence.flush_interval must be positive");
        }

        if self.persistence.batch_size == 0 {
            bail!("persistence.batch_size must be positive");
        }

        if self.exchange.retry_interval.is_zero() {
            bail!("exchange.retry_interval must be positive");
        }

        if self.exchange.max_pending == 0 {
            bail!("exchange.max_pending must be positive");
        }

        if self.alarm.enabled {
            let rate = self.alarm.error_rate_threshold;
            if !(rate > 0.0 && rate <= 1.0) {
                bail!("alarm.error_rate_threshold must be in (0, 1] (got {rate})");
            }
            if self.alarm.min_calls < 0 {
                bail!("alarm.min_calls must not be negative");
            }
        }

        if self.ttl.enabled {
            if self.ttl.metric_retention.is_zero() {
                bail!("ttl.metric_retention must be positive");
            }
            if self.ttl.sweep_interval.is_zero() {
                bail!("ttl.sweep_interval must be positive");
            }
        }

        Ok(())
    }

    /// Cluster addresses used for routing; a lone node when none are listed.
    pub fn cluster_nodes(&self) -> Vec<String> {
        if self.cluster.nodes.is_empty() {
            vec![self.cluster.self_address.clone()]
        } else {
            self.cluster.nodes.clone()
        }
    }
}
