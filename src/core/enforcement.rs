//! Enforcement of block decisions outside the core.

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by an enforcer
#[derive(Debug, Error)]
pub enum EnforcementError {
    #[error("API request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Target {0} is not supported by this enforcer")]
    Unsupported(BlockTarget),
    #[error("No active block for {0}")]
    NotBlocked(BlockTarget),
}

/// What to block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BlockTarget {
    Ip(IpAddr),
    Process(u32),
}

impl fmt::Display for BlockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockTarget::Ip(ip) => write!(f, "IP {}", ip),
            BlockTarget::Process(pid) => write!(f, "process {}", pid),
        }
    }
}

/// How long a block should last
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockDuration {
    Seconds(u64),
    Permanent,
}

impl fmt::Display for BlockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockDuration::Seconds(secs) => write!(f, "{}s", secs),
            BlockDuration::Permanent => f.write_str("permanently"),
        }
    }
}

/// Applies and lifts blocks. Callers own any retry policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Enforcer: Send + Sync {
    async fn apply_block(
        &self,
        target: BlockTarget,
        duration: BlockDuration,
    ) -> Result<(), EnforcementError>;

    async fn remove_block(&self, target: BlockTarget) -> Result<(), EnforcementError>;
}

/// Dry-run enforcer that only logs what it would do
#[derive(Debug, Default)]
pub struct LogOnlyEnforcer;

#[async_trait]
impl Enforcer for LogOnlyEnforcer {
    async fn apply_block(
        &self,
        target: BlockTarget,
        duration: BlockDuration,
    ) -> Result<(), EnforcementError> {
        info!("[dry run] would block {} {}", target, duration);
        Ok(())
    }

    async fn remove_block(&self, target: BlockTarget) -> Result<(), EnforcementError> {
        info!("[dry run] would unblock {}", target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_only_enforcer_accepts_everything() {
        let enforcer = LogOnlyEnforcer;
        let target = BlockTarget::Ip("203.0.113.9".parse().unwrap());
        assert!(enforcer.apply_block(target, BlockDuration::Seconds(300)).await.is_ok());
        assert!(enforcer.remove_block(BlockTarget::Process(42)).await.is_ok());
    }

    #[test]
    fn targets_serialize_tagged() {
        let json = serde_json::to_string(&BlockTarget::Process(42)).unwrap();
        assert_eq!(json, r#"{"kind":"process","value":42}"#);
    }
}
