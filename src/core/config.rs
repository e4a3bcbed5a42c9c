//! Configuration
//!
//! Loads blackboard tuning parameters from `config.toml`, the way the
//! teacher's `Config::load` reads `config.toml` for decay rates and
//! thresholds. All fields have sane defaults so the server runs unconfigured.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_evaluation_interval_ms")]
    pub evaluation_interval_ms: u64,
    #[serde(default = "default_max_pheromones")]
    pub max_pheromones: usize,
    #[serde(default = "default_emission_history_window_ms")]
    pub emission_history_window_ms: u64,
    #[serde(default = "default_ttl_floor")]
    pub default_ttl_floor: f64,
    #[serde(default = "default_default_half_life_ms")]
    pub default_half_life_ms: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: default_evaluation_interval_ms(),
            max_pheromones: default_max_pheromones(),
            emission_history_window_ms: default_emission_history_window_ms(),
            default_ttl_floor: default_ttl_floor(),
            default_half_life_ms: default_default_half_life_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_sse_keepalive_secs")]
    pub sse_keepalive_secs: u64,
    #[serde(default = "default_sse_replay_buffer_size")]
    pub sse_replay_buffer_size: usize,
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: i64,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sse_keepalive_secs: default_sse_keepalive_secs(),
            sse_replay_buffer_size: default_sse_replay_buffer_size(),
            session_ttl_ms: default_session_ttl_ms(),
            api_keys: Vec::new(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

fn default_evaluation_interval_ms() -> u64 {
    100
}
fn default_max_pheromones() -> usize {
    10_000
}
fn default_emission_history_window_ms() -> u64 {
    60_000
}
fn default_ttl_floor() -> f64 {
    0.01
}
fn default_default_half_life_ms() -> f64 {
    30_000.0
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8088
}
fn default_sse_keepalive_secs() -> u64 {
    30
}
fn default_sse_replay_buffer_size() -> usize {
    256
}
fn default_session_ttl_ms() -> i64 {
    3_600_000
}
fn default_rate_limit_per_minute() -> u32 {
    600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::load("config.toml")
    }
}
