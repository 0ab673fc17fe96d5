pub mod topology;

pub use topology::{
    parse_topology, validate_topology, EdgeDescriptor, StageDescriptor, StageSettings, Topology,
    TopologyError, DEFAULT_BUFFER_SIZE,
};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::SegmentSpace;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ParseError(String),

    #[error("Topology error: {0}")]
    TopologyError(#[from] TopologyError),
}

/// Autoscale thresholds (percentages) and cooldown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscaleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum seconds between two scaling actions
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Scale up only while weighted CPU is below this
    #[serde(default = "default_scale_up_cpu_below")]
    pub scale_up_cpu_below: f64,

    /// Scale up only while weighted memory is below this
    #[serde(default = "default_scale_up_memory_below")]
    pub scale_up_memory_below: f64,

    /// Scale down once weighted CPU or memory reaches this
    #[serde(default = "default_scale_down_above")]
    pub scale_down_above: f64,
}

fn default_true() -> bool {
    true
}

fn default_cooldown_secs() -> u64 {
    10
}

fn default_scale_up_cpu_below() -> f64 {
    70.0
}

fn default_scale_up_memory_below() -> f64 {
    85.0
}

fn default_scale_down_above() -> f64 {
    90.0
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            cooldown_secs: default_cooldown_secs(),
            scale_up_cpu_below: default_scale_up_cpu_below(),
            scale_up_memory_below: default_scale_up_memory_below(),
            scale_down_above: default_scale_down_above(),
        }
    }
}

/// Node manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Directory holding shared-memory segments and lock markers
    #[serde(default = "default_segment_dir")]
    pub segment_dir: PathBuf,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// How often instance monitors sample exit status
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,

    /// Wait for a segment another process is still creating
    #[serde(default = "default_attach_timeout_ms")]
    pub attach_timeout_ms: u64,

    /// Window for queue throughput (dfps) snapshots
    #[serde(default = "default_dfps_interval_ms")]
    pub dfps_interval_ms: u32,

    /// Host utilization samples kept for weighted averaging
    #[serde(default = "default_usage_history_limit")]
    pub usage_history_limit: usize,

    /// Utilization samples kept per stage
    #[serde(default = "default_stage_usage_log_limit")]
    pub stage_usage_log_limit: usize,

    /// Captured output lines drained per instance per tick
    #[serde(default = "default_output_lines_per_tick")]
    pub output_lines_per_tick: usize,

    #[serde(default)]
    pub autoscale: AutoscaleConfig,
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_segment_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() {
        shm
    } else {
        std::env::temp_dir().join("shmflow")
    }
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

fn default_lock_timeout_ms() -> u64 {
    100_000
}

fn default_lock_retry_interval_ms() -> u64 {
    50
}

fn default_attach_timeout_ms() -> u64 {
    5000
}

fn default_dfps_interval_ms() -> u32 {
    1000
}

fn default_usage_history_limit() -> usize {
    30
}

fn default_stage_usage_log_limit() -> usize {
    50
}

fn default_output_lines_per_tick() -> usize {
    3
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            segment_dir: default_segment_dir(),
            tick_interval_ms: default_tick_interval_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
            attach_timeout_ms: default_attach_timeout_ms(),
            dfps_interval_ms: default_dfps_interval_ms(),
            usage_history_limit: default_usage_history_limit(),
            stage_usage_log_limit: default_stage_usage_log_limit(),
            output_lines_per_tick: default_output_lines_per_tick(),
            autoscale: AutoscaleConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn with_segment_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.segment_dir = dir.into();
        self
    }

    pub fn with_node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = id.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_autoscale(mut self, autoscale: AutoscaleConfig) -> Self {
        self.autoscale = autoscale;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Segment space rooted at `segment_dir` with this config's lock timing
    pub fn segment_space(&self) -> SegmentSpace {
        SegmentSpace::new(&self.segment_dir)
            .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .with_lock_retry(Duration::from_millis(self.lock_retry_interval_ms))
            .with_attach_timeout(Duration::from_millis(self.attach_timeout_ms))
    }
}

// ============================================================================
// I/O wrappers - thin layer over pure parsing
// ============================================================================

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Load a node config from a YAML or JSON file
pub fn load_node_config(path: &Path) -> Result<NodeConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut config: NodeConfig = if is_yaml(path) {
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?
    } else {
        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?
    };

    let expanded = shellexpand::tilde(&config.segment_dir.to_string_lossy()).into_owned();
    config.segment_dir = PathBuf::from(expanded);
    Ok(config)
}

/// Load and validate a topology file
pub fn load_topology_file(path: &Path) -> Result<Topology, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let topology = parse_topology(&content, is_yaml(path))?;
    Ok(topology)
}
