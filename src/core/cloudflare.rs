//! Cloudflare enforcement through zone firewall access rules.

use std::net::IpAddr;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::enforcement::{BlockDuration, BlockTarget, EnforcementError, Enforcer};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareConfig {
    pub enabled: bool,
    pub api_token: String,
    pub zone_id: String,
    pub api_base: String,
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_token: String::new(),
            zone_id: String::new(),
            api_base: API_BASE.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AccessRuleRequest<'a> {
    mode: &'a str,
    configuration: AccessRuleTarget,
    notes: String,
}

#[derive(Debug, Serialize)]
struct AccessRuleTarget {
    target: &'static str,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct AccessRule {
    id: String,
}

fn access_rule_target(ip: IpAddr) -> AccessRuleTarget {
    AccessRuleTarget {
        target: if ip.is_ipv4() { "ip" } else { "ip6" },
        value: ip.to_string(),
    }
}

fn into_result<T>(response: ApiResponse<T>) -> Result<T, EnforcementError> {
    if !response.success {
        let messages: Vec<String> = response
            .errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.code))
            .collect();
        return Err(EnforcementError::InvalidResponse(messages.join("; ")));
    }
    response
        .result
        .ok_or_else(|| EnforcementError::InvalidResponse("missing result".to_string()))
}

/// Blocks IPs at the Cloudflare edge. Process targets are unsupported.
pub struct CloudflareEnforcer {
    client: Client,
    config: CloudflareConfig,
    /// Access rule id per blocked address
    rules: DashMap<IpAddr, String>,
}

impl CloudflareEnforcer {
    pub fn new(config: CloudflareConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            rules: DashMap::new(),
        }
    }

    fn rules_url(&self) -> String {
        format!(
            "{}/zones/{}/firewall/access_rules/rules",
            self.config.api_base, self.config.zone_id
        )
    }

    pub fn active_rule(&self, ip: IpAddr) -> Option<String> {
        self.rules.get(&ip).map(|id| id.clone())
    }
}

#[async_trait]
impl Enforcer for CloudflareEnforcer {
    async fn apply_block(
        &self,
        target: BlockTarget,
        duration: BlockDuration,
    ) -> Result<(), EnforcementError> {
        let BlockTarget::Ip(ip) = target else {
            return Err(EnforcementError::Unsupported(target));
        };
        if self.rules.contains_key(&ip) {
            return Ok(());
        }

        let body = AccessRuleRequest {
            mode: "block",
            configuration: access_rule_target(ip),
            notes: format!("ddos-defense: blocked {}", duration),
        };
        let response = self
            .client
            .post(self.rules_url())
            .bearer_auth(&self.config.api_token)
            .json(&body)
            .send()
            .await?;
        let rule: AccessRule = into_result(response.json().await?)?;

        info!("Cloudflare access rule {} blocks {}", rule.id, ip);
        self.rules.insert(ip, rule.id);
        Ok(())
    }

    async fn remove_block(&self, target: BlockTarget) -> Result<(), EnforcementError> {
        let BlockTarget::Ip(ip) = target else {
            return Err(EnforcementError::Unsupported(target));
        };
        let Some((_, rule_id)) = self.rules.remove(&ip) else {
            return Err(EnforcementError::NotBlocked(target));
        };

        let response = self
            .client
            .delete(format!("{}/{}", self.rules_url(), rule_id))
            .bearer_auth(&self.config.api_token)
            .send()
            .await;
        let result = match response {
            Ok(response) => response
                .json::<ApiResponse<AccessRule>>()
                .await
                .map_err(EnforcementError::from)
                .and_then(into_result),
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            warn!("Failed to remove Cloudflare rule {} for {}: {}", rule_id, ip, e);
            // Keep the id so a later call can retry the removal.
            self.rules.insert(ip, rule_id);
            return Err(e);
        }
        info!("Cloudflare access rule {} removed for {}", rule_id, ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_targets_are_unsupported() {
        let enforcer = CloudflareEnforcer::new(CloudflareConfig::default());
        let result = enforcer
            .apply_block(BlockTarget::Process(4242), BlockDuration::Permanent)
            .await;
        assert!(matches!(result, Err(EnforcementError::Unsupported(BlockTarget::Process(4242)))));
    }

    #[tokio::test]
    async fn removing_an_unknown_block_fails() {
        let enforcer = CloudflareEnforcer::new(CloudflareConfig::default());
        let target = BlockTarget::Ip("203.0.113.9".parse().unwrap());
        assert!(matches!(
            enforcer.remove_block(target).await,
            Err(EnforcementError::NotBlocked(_))
        ));
    }

    #[test]
    fn api_errors_are_surfaced() {
        let body = r#"{
            "success": false,
            "errors": [{"code": 10000, "message": "Authentication error"}],
            "result": null
        }"#;
        let response: ApiResponse<AccessRule> = serde_json::from_str(body).unwrap();
        match into_result(response) {
            Err(EnforcementError::InvalidResponse(msg)) => {
                assert!(msg.contains("Authentication error"))
            }
            other => panic!("unexpected {:?}", other.map(|r| r.id)),
        }
    }

    #[test]
    fn ipv6_targets_use_ip6() {
        assert_eq!(access_rule_target("2001:db8::1".parse().unwrap()).target, "ip6");
        assert_eq!(access_rule_target("203.0.113.9".parse().unwrap()).target, "ip");
    }
}
