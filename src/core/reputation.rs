//! IP reputation lookups.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during reputation lookups
#[derive(Debug, Error)]
pub enum ReputationError {
    #[error("Reputation request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Reputation service returned status {0}")]
    Status(u16),
    #[error("Reputation lookups are disabled")]
    Disabled,
}

/// Reputation service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Cached scores at or above this count as known-malicious
    pub malicious_score_threshold: u8,
    pub cache_ttl_secs: i64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://127.0.0.1:9000/reputation".to_string(),
            api_key: None,
            timeout_secs: 5,
            malicious_score_threshold: 75,
            cache_ttl_secs: 3600,
        }
    }
}

/// Threat-intel verdict for one address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationReport {
    /// 0 (clean) to 100 (known bad)
    pub score: u8,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default = "Utc::now")]
    pub as_of: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReputationLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<ReputationReport, ReputationError>;
}

/// Reputation client for a JSON `GET {base_url}?ip=` endpoint
pub struct HttpReputationClient {
    client: Client,
    config: ReputationConfig,
}

impl HttpReputationClient {
    pub fn new(config: ReputationConfig) -> Result<Self, ReputationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ReputationLookup for HttpReputationClient {
    async fn lookup(&self, ip: IpAddr) -> Result<ReputationReport, ReputationError> {
        if !self.config.enabled {
            return Err(ReputationError::Disabled);
        }

        let mut request = self
            .client
            .get(&self.config.base_url)
            .query(&[("ip", ip.to_string())]);
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ReputationError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}
