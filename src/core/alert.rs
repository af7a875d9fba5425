//! Alert types produced by the detection stages.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attack classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttackType {
    SynFlood,
    UdpFlood,
    IcmpFlood,
    HttpFlood,
    ConnectionFlood,
    BandwidthFlood,
    Slowloris,
    UdpAmplification,
    RstFlood,
    Fragmentation,
    Botnet,
    TcpFlagAnomaly,
    PacketSizeAnomaly,
    HighTrafficRate,
}

impl fmt::Display for AttackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttackType::SynFlood => "SYN flood",
            AttackType::UdpFlood => "UDP flood",
            AttackType::IcmpFlood => "ICMP flood",
            AttackType::HttpFlood => "HTTP flood",
            AttackType::ConnectionFlood => "connection flood",
            AttackType::BandwidthFlood => "bandwidth flood",
            AttackType::Slowloris => "Slowloris",
            AttackType::UdpAmplification => "UDP amplification",
            AttackType::RstFlood => "TCP RST flood",
            AttackType::Fragmentation => "IP fragmentation",
            AttackType::Botnet => "botnet pattern",
            AttackType::TcpFlagAnomaly => "TCP flag anomaly",
            AttackType::PacketSizeAnomaly => "packet size anomaly",
            AttackType::HighTrafficRate => "high traffic rate",
        };
        f.write_str(name)
    }
}

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity from `observed / threshold`: Critical ≥ 5×, High ≥ 3×, Medium ≥ 2×, else Low.
    pub fn from_ratio(observed: f64, threshold: f64) -> Self {
        let ratio = if threshold > 0.0 { observed / threshold } else { f64::INFINITY };
        if ratio >= 5.0 {
            Severity::Critical
        } else if ratio >= 3.0 {
            Severity::High
        } else if ratio >= 2.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn recommended_action(self) -> &'static str {
        match self {
            Severity::Critical => "Block source immediately and enable upstream scrubbing",
            Severity::High => "Block source and rate limit the affected service",
            Severity::Medium => "Rate limit source and keep monitoring",
            Severity::Low => "Monitor source",
        }
    }
}

/// Alert emitted by a threshold detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdosAlert {
    pub id: String,
    pub attack_type: AttackType,
    pub severity: Severity,
    pub source_ip: IpAddr,
    pub destination_ip: Option<IpAddr>,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    pub packet_count: u64,
    pub connection_count: u64,
    pub byte_count: u64,
    pub recommended_action: String,
    pub is_resolved: bool,
}

impl DdosAlert {
    pub fn new(
        attack_type: AttackType,
        severity: Severity,
        source_ip: IpAddr,
        description: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            attack_type,
            severity,
            source_ip,
            destination_ip: None,
            description: description.into(),
            detected_at,
            packet_count: 0,
            connection_count: 0,
            byte_count: 0,
            recommended_action: severity.recommended_action().to_string(),
            is_resolved: false,
        }
    }

    pub fn with_destination(mut self, destination_ip: Option<IpAddr>) -> Self {
        self.destination_ip = destination_ip;
        self
    }

    pub fn with_counts(mut self, packets: u64, connections: u64, bytes: u64) -> Self {
        self.packet_count = packets;
        self.connection_count = connections;
        self.byte_count = bytes;
        self
    }

    pub fn resolve(&mut self) {
        self.is_resolved = true;
    }
}

/// Alert emitted by the composed packet analyzer, carrying its evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedDdosAlert {
    #[serde(flatten)]
    pub alert: DdosAlert,
    /// Confidence in `[0, 100]`
    pub confidence: f64,
    pub signature_id: Option<String>,
    pub flow: Option<String>,
    pub evidence: Vec<String>,
}

impl AdvancedDdosAlert {
    pub fn new(alert: DdosAlert, confidence: f64) -> Self {
        Self {
            alert,
            confidence,
            signature_id: None,
            flow: None,
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence.push(evidence.into());
        self
    }

    pub fn with_flow(mut self, flow: impl ToString) -> Self {
        self.flow = Some(flow.to_string());
        self
    }

    pub fn with_signature(mut self, signature_id: impl Into<String>) -> Self {
        self.signature_id = Some(signature_id.into());
        self
    }
}
