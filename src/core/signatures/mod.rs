//! Signature registry and evaluation.
//!
//! A signature is a named conjunction of [`SubPattern`] matchers: it matches a
//! batch only when every sub-pattern matches. Signatures are plain serde data,
//! so additional ones can be loaded from a JSON rules file at startup.

pub mod defaults;
pub mod patterns;

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::alert::{AttackType, Severity};
use crate::core::packet::PacketRecord;

pub use defaults::default_signatures;
pub use patterns::{PatternMatch, SubPattern};

/// Errors that can occur while loading or evaluating signatures
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Invalid {pattern} pattern: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("Signature {0} is already registered")]
    DuplicateId(String),
    #[error("Signature {0} has no patterns")]
    Empty(String),
    #[error("Failed to read signature file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse signature file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Signature configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Optional JSON file holding an array of signatures
    pub rules_file: Option<String>,
    /// Whether to register the built-in signatures
    pub include_defaults: bool,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            rules_file: None,
            include_defaults: true,
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

/// Signature definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub attack_type: AttackType,
    pub severity: Severity,
    pub patterns: Vec<SubPattern>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

/// Result of evaluating one signature over a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureMatch {
    pub signature_id: String,
    pub signature_name: String,
    pub attack_type: AttackType,
    pub severity: Severity,
    pub is_match: bool,
    /// Mean of the sub-pattern scores, in `[0, 100]`
    pub score: f64,
    pub source_ip: Option<IpAddr>,
    pub details: Vec<String>,
}

impl Signature {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        attack_type: AttackType,
        severity: Severity,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            attack_type,
            severity,
            patterns: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_pattern(mut self, pattern: SubPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn validate(&self) -> Result<(), SignatureError> {
        if self.patterns.is_empty() {
            return Err(SignatureError::Empty(self.id.clone()));
        }
        self.patterns.iter().try_for_each(SubPattern::validate)
    }

    /// Evaluates every sub-pattern. The signature matches only if all of them
    /// match; the source is taken from the first matching sub-pattern.
    pub fn evaluate(
        &self,
        packets: &[PacketRecord],
        now: DateTime<Utc>,
    ) -> Result<SignatureMatch, SignatureError> {
        self.validate()?;

        let results = self
            .patterns
            .iter()
            .map(|pattern| pattern.evaluate(packets, now))
            .collect::<Result<Vec<_>, _>>()?;

        let is_match = results.iter().all(|r| r.is_match);
        let score = results.iter().map(|r| r.score).sum::<f64>() / results.len() as f64;
        let source_ip = results.iter().filter(|r| r.is_match).find_map(|r| r.source_ip);

        Ok(SignatureMatch {
            signature_id: self.id.clone(),
            signature_name: self.name.clone(),
            attack_type: self.attack_type,
            severity: self.severity,
            is_match,
            score,
            source_ip,
            details: results
                .into_iter()
                .map(|r| format!("{}: {}", r.pattern, r.details))
                .collect(),
        })
    }
}

/// A signature that could not be evaluated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureFailure {
    pub signature_id: String,
    pub message: String,
}

/// Matches and failures from one scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignatureScan {
    pub matches: Vec<SignatureMatch>,
    pub failures: Vec<SignatureFailure>,
}

/// Registry of named signatures
#[derive(Debug, Default)]
pub struct SignatureEngine {
    signatures: RwLock<Vec<Signature>>,
}

impl SignatureEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        Self {
            signatures: RwLock::new(default_signatures()),
        }
    }

    pub fn from_config(config: &SignatureConfig) -> Result<Self, SignatureError> {
        let engine = if config.include_defaults {
            Self::with_defaults()
        } else {
            Self::new()
        };
        if let Some(path) = &config.rules_file {
            for signature in load_signatures(path)? {
                engine.register(signature)?;
            }
        }
        info!("Signature engine ready with {} signatures", engine.len());
        Ok(engine)
    }

    pub fn register(&self, signature: Signature) -> Result<(), SignatureError> {
        signature.validate()?;
        let mut signatures = self.signatures.write();
        if signatures.iter().any(|s| s.id == signature.id) {
            return Err(SignatureError::DuplicateId(signature.id));
        }
        signatures.push(signature);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut signatures = self.signatures.write();
        let before = signatures.len();
        signatures.retain(|s| s.id != id);
        signatures.len() != before
    }

    pub fn signatures(&self) -> Vec<Signature> {
        self.signatures.read().clone()
    }

    pub fn len(&self) -> usize {
        self.signatures.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluates every enabled signature. A failing signature is reported
    /// and skipped; it never prevents the others from being evaluated.
    pub fn evaluate(&self, packets: &[PacketRecord], now: DateTime<Utc>) -> SignatureScan {
        let signatures = self.signatures.read();
        let mut scan = SignatureScan::default();
        for signature in signatures.iter().filter(|s| s.enabled) {
            match signature.evaluate(packets, now) {
                Ok(result) if result.is_match => scan.matches.push(result),
                Ok(_) => {}
                Err(e) => {
                    warn!("Signature {} could not be evaluated: {}", signature.id, e);
                    scan.failures.push(SignatureFailure {
                        signature_id: signature.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
        scan
    }
}

/// Load signatures from a JSON file holding an array of [`Signature`]
pub fn load_signatures(path: &str) -> Result<Vec<Signature>, SignatureError> {
    let json = std::fs::read_to_string(path)?;
    let signatures: Vec<Signature> = serde_json::from_str(&json)?;
    Ok(signatures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::{Protocol, TcpFlags};
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn syn_burst(count: i64) -> Vec<PacketRecord> {
        (0..count)
            .map(|i| {
                PacketRecord::tcp(
                    base() + Duration::milliseconds(i * 5),
                    (ip("203.0.113.9"), 1024 + i as u16),
                    (ip("10.0.0.1"), 80),
                    60,
                    TcpFlags::SYN,
                )
            })
            .collect()
    }

    #[test]
    fn seven_defaults_are_registered() {
        let engine = SignatureEngine::with_defaults();
        assert_eq!(engine.len(), 7);
        assert!(engine.signatures().iter().all(|s| s.validate().is_ok()));
    }

    #[test]
    fn conjunction_requires_every_pattern() {
        let signature = Signature::new("TEST", "two patterns", AttackType::SynFlood, Severity::High)
            .with_pattern(SubPattern::TcpFlags {
                required: TcpFlags::SYN,
                forbidden: TcpFlags::ACK,
                min_count: 10,
                window_secs: 10,
            })
            .with_pattern(SubPattern::PacketRate {
                protocol: Some(Protocol::Icmp),
                min_packets_per_second: 1.0,
                window_secs: 10,
            });
        let result = signature.evaluate(&syn_burst(50), base() + Duration::seconds(1)).unwrap();
        assert!(!result.is_match);
        assert!(result.score > 0.0 && result.score < 100.0);
    }

    #[test]
    fn default_syn_flood_signature_matches_burst() {
        let engine = SignatureEngine::with_defaults();
        let scan = engine.evaluate(&syn_burst(150), base() + Duration::seconds(1));
        let syn = scan
            .matches
            .iter()
            .find(|m| m.signature_id == "SIG-SYN-FLOOD")
            .expect("SYN flood signature should match");
        assert_eq!(syn.source_ip, Some(ip("203.0.113.9")));
        assert!(scan.failures.is_empty());
    }

    #[test]
    fn udp_amplification_scenario() {
        let mut packets = Vec::new();
        for i in 0..5 {
            let ts = base() + Duration::milliseconds(i * 20);
            let (client, resolver) = ((ip("198.51.100.53"), 33000), (ip("10.0.0.1"), 53));
            packets.push(PacketRecord::udp(ts, client, resolver, 80));
            packets.push(PacketRecord::udp(ts, client, resolver, 900));
        }
        let engine = SignatureEngine::with_defaults();
        let scan = engine.evaluate(&packets, base() + Duration::seconds(1));
        assert!(scan.matches.iter().any(|m| m.signature_id == "SIG-UDP-AMP"));
    }

    #[test]
    fn botnet_signature_needs_regular_timing_and_sizes() {
        let packets: Vec<PacketRecord> = (0..30)
            .map(|i| {
                PacketRecord::udp(
                    base() + Duration::milliseconds(i * 100),
                    (ip("203.0.113.77"), 5000),
                    (ip("10.0.0.1"), 9999),
                    128,
                )
            })
            .collect();
        let engine = SignatureEngine::with_defaults();
        let scan = engine.evaluate(&packets, base() + Duration::seconds(3));
        assert!(scan.matches.iter().any(|m| m.attack_type == AttackType::Botnet));
    }

    #[test]
    fn registration_rejects_duplicates_and_empty_signatures() {
        let engine = SignatureEngine::with_defaults();
        let duplicate = default_signatures().remove(0);
        assert!(matches!(engine.register(duplicate), Err(SignatureError::DuplicateId(_))));
        let empty = Signature::new("EMPTY", "empty", AttackType::Botnet, Severity::Low);
        assert!(matches!(engine.register(empty), Err(SignatureError::Empty(_))));
        assert!(engine.remove("SIG-BOTNET"));
        assert_eq!(engine.len(), 6);
    }

    #[test]
    fn signatures_load_from_json_file() {
        let path = std::env::temp_dir().join(format!("signatures-{}.json", uuid::Uuid::new_v4()));
        let json = r#"[{
            "id": "CUSTOM-TINY",
            "name": "tiny packets",
            "attack_type": "UdpFlood",
            "severity": "Medium",
            "patterns": [
                {
                    "type": "packet_size",
                    "min_size": 0,
                    "max_size": 64,
                    "min_count": 100,
                    "window_secs": 10
                }
            ]
        }]"#;
        std::fs::write(&path, json).unwrap();

        let config = SignatureConfig {
            rules_file: Some(path.to_string_lossy().into_owned()),
            include_defaults: false,
        };
        let engine = SignatureEngine::from_config(&config).unwrap();
        assert_eq!(engine.len(), 1);
        assert!(engine.signatures()[0].enabled);
        std::fs::remove_file(path).ok();
    }
}
