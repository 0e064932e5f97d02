use anyhow::Result;
use serde::Deserialize;

use crate::error::Error;

/// Application configuration loaded from a TOML file or defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub identify: IdentifyConfig,

    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Capture and flow-engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Interface to sniff. When unset, the first non-loopback device is used.
    pub interface: Option<String>,

    /// Kernel-side BPF filter applied to the capture handle.
    #[serde(default = "default_bpf_filter")]
    pub bpf_filter: String,

    /// Uniform sampling rate in (0, 1]: keep every ceil(1/rate)-th packet.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// Seconds of inactivity after which a flow is finalized.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_s: u64,

    /// How often the idle sweeper runs.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_s: u64,

    /// Flow count at which the batch writer flushes early.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds between periodic batch-writer flushes.
    #[serde(default = "default_batch_interval")]
    pub batch_interval_s: u64,

    /// Process IPv6 packets.
    #[serde(default = "default_true")]
    pub enable_ipv6: bool,

    /// Skip loopback traffic entirely.
    #[serde(default)]
    pub skip_local_traffic: bool,
}

/// Settings for the enhanced identification helpers (DNS, DPI, banners).
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifyConfig {
    #[serde(default = "default_true")]
    pub reverse_dns_enabled: bool,

    /// Per-lookup timeout in seconds.
    #[serde(default = "default_reverse_dns_timeout")]
    pub reverse_dns_timeout_s: u64,

    #[serde(default = "default_reverse_dns_retries")]
    pub reverse_dns_retries: u32,

    /// Payload-signature application detection.
    #[serde(default = "default_true")]
    pub enable_dpi: bool,

    /// ALPN extraction from TLS ClientHello packets.
    #[serde(default = "default_true")]
    pub enable_alpn: bool,

    /// Host header extraction from HTTP requests.
    #[serde(default = "default_true")]
    pub enable_http_host: bool,
}

/// Data retention settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Age in days at which flows and dismissed threats are purged.
    #[serde(default = "default_retention_days")]
    pub data_retention_days: u32,
}

fn default_db_path() -> String {
    "netsentry.db".to_string()
}

fn default_bpf_filter() -> String {
    "ip or ip6".to_string()
}

fn default_sampling_rate() -> f64 {
    1.0
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_interval() -> u64 {
    5
}

fn default_reverse_dns_timeout() -> u64 {
    2
}

fn default_reverse_dns_retries() -> u32 {
    2
}

fn default_retention_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            capture: CaptureConfig::default(),
            identify: IdentifyConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            bpf_filter: default_bpf_filter(),
            sampling_rate: default_sampling_rate(),
            idle_timeout_s: default_idle_timeout(),
            sweep_interval_s: default_sweep_interval(),
            batch_size: default_batch_size(),
            batch_interval_s: default_batch_interval(),
            enable_ipv6: true,
            skip_local_traffic: false,
        }
    }
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            reverse_dns_enabled: true,
            reverse_dns_timeout_s: default_reverse_dns_timeout(),
            reverse_dns_retries: default_reverse_dns_retries(),
            enable_dpi: true,
            enable_alpn: true,
            enable_http_host: true,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            data_retention_days: default_retention_days(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::de::from_str(&contents)?;
        Ok(config)
    }

    /// Validate the configuration. Called once at startup; any error here
    /// aborts the process before services come up.
    pub fn validate(&self) -> Result<(), Error> {
        if self.db_path.trim().is_empty() {
            return Err(Error::Config("db_path cannot be empty".into()));
        }
        if !(self.capture.sampling_rate > 0.0 && self.capture.sampling_rate <= 1.0) {
            return Err(Error::Config(format!(
                "sampling_rate must be in (0, 1], got {}",
                self.capture.sampling_rate
            )));
        }
        if self.capture.batch_size == 0 || self.capture.batch_size > 1000 {
            return Err(Error::Config(format!(
                "batch_size must be in 1..=1000, got {}",
                self.capture.batch_size
            )));
        }
        if !(1..=365).contains(&self.retention.data_retention_days) {
            return Err(Error::Config(format!(
                "data_retention_days must be in 1..=365, got {}",
                self.retention.data_retention_days
            )));
        }
        Ok(())
    }
}
