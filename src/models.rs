use serde::{Deserialize, Serialize};

use crate::core::cloudflare::CloudflareConfig;
use crate::core::reputation::ReputationConfig;
use crate::core::{
    AnalyzerConfig, BlockRuleConfig, DdosDetectionConfig, OrchestratorConfig, RateLimitConfig,
    SignatureConfig,
};

/// Redis configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Persist block events to Redis instead of keeping them in memory
    pub enabled: bool,
    /// Redis connection URL
    pub url: String,
    /// Block events older than this are pruned from the sorted set
    pub retention_days: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://127.0.0.1:6379".to_string(),
            retention_days: 30,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: "127.0.0.1:9091".to_string(),
        }
    }
}

/// Memory store capacity when Redis is disabled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub memory_capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { memory_capacity: 10_000 }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    pub history: HistoryConfig,
    /// Threshold detector configuration
    pub detection: DdosDetectionConfig,
    pub analyzer: AnalyzerConfig,
    pub signatures: SignatureConfig,
    /// Rate limiter configuration
    pub rate_limit: RateLimitConfig,
    pub block_rules: BlockRuleConfig,
    pub orchestrator: OrchestratorConfig,
    pub reputation: ReputationConfig,
    pub cloudflare: CloudflareConfig,
    pub metrics: MetricsConfig,
}
