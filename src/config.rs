//! Node configuration
//!
//! Every configuration key the node understands, with defaults and
//! validation. Loading config files and parsing CLI arguments into this
//! struct happens outside this crate; this module only owns the struct,
//! its defaults, and validation, the same split a typical application
//! settings module uses.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-engine-runtime overrides for idle timeout and capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineLimits {
    /// Unload a model after this many seconds of inactivity.
    pub idle_timeout_sec: u64,
    /// Cap of concurrently loaded models for this engine (0 = unlimited).
    pub max_loaded_models: usize,
    /// Cap on total loaded-model memory bytes for this engine (0 = unlimited).
    pub max_memory_bytes: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            idle_timeout_sec: 30 * 60,
            max_loaded_models: 0,
            max_memory_bytes: 0,
        }
    }
}

/// Downloader defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub max_concurrency: usize,
    pub max_bytes_per_sec: u64,
    pub chunk_size: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 500,
            max_concurrency: 4,
            max_bytes_per_sec: 0,
            chunk_size: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub router_url: Option<String>,
    pub router_api_key: Option<String>,
    pub models_dir: PathBuf,
    pub engine_plugins_dir: Option<PathBuf>,
    pub shared_models_dir: Option<PathBuf>,
    pub node_port: u16,
    pub heartbeat_interval_sec: u64,
    pub require_gpu: bool,
    pub engine_limits: EngineLimits,
    pub plugin_restart_interval_sec: Option<u64>,
    pub plugin_restart_request_limit: Option<u64>,
    pub origin_allowlist: Vec<String>,
    pub download: DownloadConfig,
    /// Whether sync's `to_delete` list should ever actually remove local
    /// models. Default false; sync always only *reports* the list unless
    /// this is set and `ModelSync::apply_deletions` is called explicitly.
    pub sync_delete_stale: bool,
    /// Watermark fraction (0.0-1.0) of VRAM/RAM that triggers eviction.
    pub resource_watermark: f32,
    /// Resource-monitor sampling interval.
    pub resource_sample_interval_sec: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            router_url: None,
            router_api_key: None,
            models_dir: default_models_dir(),
            engine_plugins_dir: None,
            shared_models_dir: None,
            node_port: 11434,
            heartbeat_interval_sec: 10,
            require_gpu: false,
            engine_limits: EngineLimits::default(),
            plugin_restart_interval_sec: None,
            plugin_restart_request_limit: None,
            origin_allowlist: Vec::new(),
            download: DownloadConfig::default(),
            sync_delete_stale: false,
            resource_watermark: 0.9,
            resource_sample_interval_sec: 5,
        }
    }
}

fn default_models_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "llm-node", "llm-node")
        .map(|dirs| dirs.data_dir().join("models"))
        .unwrap_or_else(|| PathBuf::from("./models"))
}

impl NodeConfig {
    /// Clamp and repair fields that would otherwise leave the node in an
    /// unusable state (zero intervals, out-of-range watermark, etc).
    pub fn validate(&mut self) {
        self.resource_watermark = self.resource_watermark.clamp(0.0, 1.0);
        if self.heartbeat_interval_sec == 0 {
            self.heartbeat_interval_sec = 10;
        }
        if self.resource_sample_interval_sec == 0 {
            self.resource_sample_interval_sec = 5;
        }
        if self.download.max_concurrency == 0 {
            self.download.max_concurrency = 1;
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        let mut cfg: Self = toml::from_str(s)?;
        cfg.validate();
        Ok(cfg)
    }

    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        let mut cfg: Self = serde_json::from_str(s)?;
        cfg.validate();
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_port, 11434);
        assert_eq!(cfg.heartbeat_interval_sec, 10);
        assert!(!cfg.sync_delete_stale);
        assert_eq!(cfg.engine_limits.idle_timeout_sec, 1800);
    }

    #[test]
    fn validate_clamps_watermark() {
        let mut cfg = NodeConfig::default();
        cfg.resource_watermark = 5.0;
        cfg.validate();
        assert_eq!(cfg.resource_watermark, 1.0);
    }

    #[test]
    fn validate_repairs_zero_intervals() {
        let mut cfg = NodeConfig::default();
        cfg.heartbeat_interval_sec = 0;
        cfg.resource_sample_interval_sec = 0;
        cfg.download.max_concurrency = 0;
        cfg.validate();
        assert_eq!(cfg.heartbeat_interval_sec, 10);
        assert_eq!(cfg.resource_sample_interval_sec, 5);
        assert_eq!(cfg.download.max_concurrency, 1);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = NodeConfig::default();
        let s = toml::to_string(&cfg).unwrap();
        let parsed = NodeConfig::from_toml_str(&s).unwrap();
        assert_eq!(parsed.node_port, cfg.node_port);
    }
}
