//! Configuration options.
//!
//! The meter is configured through a TOML file defining worker count, flow
//! cache sizing and timeouts, fragment cache options, the process plugin
//! set, and the exporter output. The path to the configuration file itself
//! is typically a command line argument of the embedding application.

use crate::export::ipfix::{DEFAULT_MTU, DEFAULT_TEMPLATE_REFRESH};
use crate::flowtable::FlowCacheConfig;
use crate::fragcache;
use crate::utils::options::PluginSpec;
use crate::utils::Timeval;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> RuntimeConfig {
    let config_str = fs::read_to_string(path).expect("ERROR: File read failed");
    let config: RuntimeConfig = toml::from_str(&config_str).expect("Invalid config file");
    config
}

/// Returns a default configuration: one worker, default cache sizing, text
/// output to stdout. For demonstration purposes, not tuned for performance.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads; one input source is required per worker.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Process plugins as `name:opt=val;...` specifications, in hook
    /// invocation order.
    #[serde(default = "default_plugins")]
    pub plugins: Vec<String>,

    /// Log per-plugin statistics at shutdown.
    #[serde(default = "default_print_stats")]
    pub print_stats: bool,

    /// Flow cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Fragment cache settings.
    #[serde(default)]
    pub frag: FragConfig,

    /// Exporter output settings.
    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            workers: 1,
            plugins: default_plugins(),
            print_stats: false,
            cache: CacheConfig::default(),
            frag: FragConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parses the plugin specification strings.
    pub fn plugin_specs(&self) -> Result<Vec<PluginSpec>, crate::utils::options::OptionsError> {
        self.plugins.iter().map(|s| PluginSpec::parse(s)).collect()
    }
}

fn default_workers() -> usize {
    1
}

fn default_plugins() -> Vec<String> {
    vec![]
}

fn default_print_stats() -> bool {
    false
}

/// Flow cache sizing and timeouts.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CacheConfig {
    /// Total flow capacity (rounded up to a power of two).
    #[serde(default = "default_cache_size")]
    pub size: usize,

    /// Slots per bucket (rounded up to a power of two).
    #[serde(default = "default_cache_line")]
    pub line: usize,

    /// Active timeout in seconds, measured from the first packet.
    #[serde(default = "default_active")]
    pub active: u64,

    /// Inactive timeout in seconds, measured from the last packet.
    #[serde(default = "default_inactive")]
    pub inactive: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            size: default_cache_size(),
            line: default_cache_line(),
            active: default_active(),
            inactive: default_inactive(),
        }
    }
}

impl From<&CacheConfig> for FlowCacheConfig {
    fn from(config: &CacheConfig) -> Self {
        FlowCacheConfig {
            cache_size: config.size,
            line_size: config.line,
            active_timeout: Timeval::new(config.active as i64, 0),
            inactive_timeout: Timeval::new(config.inactive as i64, 0),
        }
    }
}

fn default_cache_size() -> usize {
    1 << 17
}

fn default_cache_line() -> usize {
    16
}

fn default_active() -> u64 {
    300
}

fn default_inactive() -> u64 {
    30
}

/// Fragment cache settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FragConfig {
    /// Disable port imputation for IP fragments.
    #[serde(default)]
    pub disable: bool,

    /// Bucket count; prime values spread keys best.
    #[serde(default = "default_frag_buckets")]
    pub buckets: usize,

    /// Entry timeout in seconds.
    #[serde(default = "default_frag_timeout")]
    pub timeout: u64,
}

impl Default for FragConfig {
    fn default() -> Self {
        FragConfig {
            disable: false,
            buckets: default_frag_buckets(),
            timeout: default_frag_timeout(),
        }
    }
}

fn default_frag_buckets() -> usize {
    fragcache::DEFAULT_BUCKET_COUNT
}

fn default_frag_timeout() -> u64 {
    fragcache::DEFAULT_TIMEOUT.sec as u64
}

/// Exporter transport selection.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputProtocol {
    /// IPFIX over UDP, best-effort.
    Udp,
    /// IPFIX over TCP with reconnect.
    Tcp,
    /// Text lines to stdout (debugging).
    Text,
}

/// Exporter output settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_protocol")]
    pub protocol: OutputProtocol,

    /// Collector host (IPFIX outputs).
    #[serde(default = "default_host")]
    pub host: String,

    /// Collector port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Message size limit.
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Template republish interval in seconds.
    #[serde(default = "default_template_refresh")]
    pub template_refresh: u64,

    /// Observation domain ID.
    #[serde(default = "default_odid")]
    pub odid: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            protocol: default_protocol(),
            host: default_host(),
            port: default_port(),
            mtu: default_mtu(),
            template_refresh: default_template_refresh(),
            odid: default_odid(),
        }
    }
}

fn default_protocol() -> OutputProtocol {
    OutputProtocol::Text
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4739
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

fn default_template_refresh() -> u64 {
    DEFAULT_TEMPLATE_REFRESH.sec as u64
}

fn default_odid() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_config_defaults() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config.workers, 1);
        assert_eq!(config.cache.size, 1 << 17);
        assert_eq!(config.cache.line, 16);
        assert_eq!(config.output.protocol, OutputProtocol::Text);
    }

    #[test]
    fn core_config_parses_sections() {
        let toml = r#"
            workers = 4
            plugins = ["pstats:skipdup", "dns"]

            [cache]
            size = 1024
            line = 4
            active = 60
            inactive = 10

            [output]
            protocol = "udp"
            host = "192.0.2.7"
            port = 9999
        "#;
        let config: RuntimeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.cache.line, 4);
        assert_eq!(config.output.protocol, OutputProtocol::Udp);
        let specs = config.plugin_specs().unwrap();
        assert_eq!(specs[0].name, "pstats");
        assert!(specs[0].flag("skipdup"));
    }
}
