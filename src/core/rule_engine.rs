//! Graduated block decisions for individual connections.
//!
//! Rules are grouped in three tiers. Evaluation stops at the first tier with
//! at least one firing rule: tier one yields `Immediate`, tier two `Warning`,
//! tier three `Monitor`. Internal addresses and OS system binaries are
//! allowed before any rule runs.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::packet::{PacketRecord, Protocol};
use crate::core::reputation::{ReputationLookup, ReputationReport};
use crate::utils::is_internal_address;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Block level, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockLevel {
    None,
    Monitor,
    Warning,
    Immediate,
}

impl BlockLevel {
    pub fn recommended_action(self) -> &'static str {
        match self {
            BlockLevel::Immediate => "Block the connection and quarantine the process",
            BlockLevel::Warning => "Alert an operator and raise monitoring for this source",
            BlockLevel::Monitor => "Log and keep monitoring",
            BlockLevel::None => "Allow",
        }
    }
}

impl fmt::Display for BlockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Block decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDecision {
    pub level: BlockLevel,
    pub reason: String,
    /// Sum of the weights of every rule that fired in the deciding tier
    pub confidence_score: f64,
    pub triggered_rules: Vec<String>,
    pub threat_category: String,
    pub recommended_action: String,
    pub analyzed_at: DateTime<Utc>,
}

impl BlockDecision {
    fn allow(reason: impl Into<String>, analyzed_at: DateTime<Utc>) -> Self {
        Self {
            level: BlockLevel::None,
            reason: reason.into(),
            confidence_score: 0.0,
            triggered_rules: Vec::new(),
            threat_category: "None".to_string(),
            recommended_action: BlockLevel::None.recommended_action().to_string(),
            analyzed_at,
        }
    }

    pub fn should_block(&self) -> bool {
        self.level == BlockLevel::Immediate
    }
}

fn observed_now() -> DateTime<Utc> {
    Utc::now()
}

/// Everything the rules may look at for one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionFact {
    pub remote_ip: IpAddr,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default)]
    pub executable_path: Option<String>,
    #[serde(default)]
    pub bytes_transferred: u64,
    /// `None` when the signature state is unknown
    #[serde(default)]
    pub is_signed: Option<bool>,
    #[serde(default)]
    pub is_elevated: bool,
    #[serde(default)]
    pub remote_country: Option<String>,
    /// When the owning program was first observed
    #[serde(default)]
    pub program_first_seen: Option<DateTime<Utc>>,
    /// Std dev of the gaps between this program's connections
    #[serde(default)]
    pub connection_interval_std_dev_ms: Option<f64>,
    #[serde(default)]
    pub connections_last_minute: u32,
    #[serde(default = "observed_now")]
    pub observed_at: DateTime<Utc>,
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

impl ConnectionFact {
    pub fn new(remote_ip: IpAddr, observed_at: DateTime<Utc>) -> Self {
        Self {
            remote_ip,
            remote_port: None,
            local_port: None,
            protocol: Protocol::Tcp,
            process_id: None,
            process_name: None,
            executable_path: None,
            bytes_transferred: 0,
            is_signed: None,
            is_elevated: false,
            remote_country: None,
            program_first_seen: None,
            connection_interval_std_dev_ms: None,
            connections_last_minute: 0,
            observed_at,
        }
    }

    /// Inbound view of a packet: the sender is the remote side.
    pub fn from_packet(packet: &PacketRecord) -> Self {
        let mut fact = Self::new(packet.src_ip, packet.timestamp);
        fact.remote_port = packet.src_port;
        fact.local_port = packet.dst_port;
        fact.protocol = packet.protocol;
        fact.process_id = packet.process_id;
        fact.process_name = packet.process_name.clone();
        fact.bytes_transferred = u64::from(packet.length);
        fact
    }

    pub fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn with_process(mut self, process_id: u32, process_name: impl Into<String>) -> Self {
        self.process_id = Some(process_id);
        self.process_name = Some(process_name.into());
        self
    }

    pub fn with_executable_path(mut self, path: impl Into<String>) -> Self {
        self.executable_path = Some(path.into());
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes_transferred = bytes;
        self
    }

    pub fn with_signed(mut self, signed: bool) -> Self {
        self.is_signed = Some(signed);
        self
    }

    pub fn with_elevated(mut self, elevated: bool) -> Self {
        self.is_elevated = elevated;
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.remote_country = Some(country.into());
        self
    }

    pub fn with_program_first_seen(mut self, first_seen: DateTime<Utc>) -> Self {
        self.program_first_seen = Some(first_seen);
        self
    }

    pub fn with_interval_std_dev(mut self, std_dev_ms: f64) -> Self {
        self.connection_interval_std_dev_ms = Some(std_dev_ms);
        self
    }

    pub fn with_connection_rate(mut self, connections_last_minute: u32) -> Self {
        self.connections_last_minute = connections_last_minute;
        self
    }
}

/// Block rule configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockRuleConfig {
    pub malicious_ips: Vec<IpAddr>,
    pub suspicious_ports: Vec<u16>,
    pub legitimate_ports: Vec<u16>,
    /// Processes whose genuine instance runs as PID 0 without an `.exe` image
    pub protected_process_names: Vec<String>,
    /// Lowercase fragments marking an executable location as suspicious
    pub suspicious_path_fragments: Vec<String>,
    /// Lowercase path prefixes of trusted OS binaries
    pub system_path_prefixes: Vec<String>,
    pub restricted_countries: Vec<String>,
    pub abnormal_transfer_mb: u64,
    pub network_pattern_threshold: u32,
    pub periodic_max_std_dev_ms: f64,
    pub new_program_window_hours: i64,
    /// Offset applied to `observed_at` for the hour-of-day rule
    pub utc_offset_minutes: i32,
    pub unusual_hours_start: u32,
    pub unusual_hours_end: u32,
    pub malicious_score_threshold: u8,
    pub reputation_cache_ttl_secs: i64,
}

impl Default for BlockRuleConfig {
    fn default() -> Self {
        Self {
            malicious_ips: Vec::new(),
            suspicious_ports: vec![1337, 4444, 5555, 6666, 6667, 12345, 27374, 31337],
            legitimate_ports: vec![
                20, 21, 22, 25, 53, 80, 110, 123, 143, 443, 465, 587, 993, 995, 3389, 8080, 8443,
            ],
            protected_process_names: vec!["system idle process".to_string()],
            suspicious_path_fragments: vec![
                "\\temp\\".to_string(),
                "\\appdata\\local\\temp".to_string(),
                "\\downloads\\".to_string(),
                "$recycle.bin".to_string(),
                "/tmp/".to_string(),
                "/downloads/".to_string(),
            ],
            system_path_prefixes: vec![
                "c:\\windows\\system32\\".to_string(),
                "c:\\windows\\syswow64\\".to_string(),
                "/usr/sbin/".to_string(),
                "/usr/lib/systemd/".to_string(),
            ],
            restricted_countries: Vec::new(),
            abnormal_transfer_mb: 100,
            network_pattern_threshold: 100,
            periodic_max_std_dev_ms: 50.0,
            new_program_window_hours: 24,
            utc_offset_minutes: 0,
            unusual_hours_start: 2,
            unusual_hours_end: 6,
            malicious_score_threshold: 75,
            reputation_cache_ttl_secs: 3600,
        }
    }
}

struct RuleHit {
    rule: &'static str,
    weight: f64,
    category: &'static str,
    detail: String,
}

impl RuleHit {
    fn new(rule: &'static str, weight: f64, category: &'static str, detail: String) -> Self {
        Self {
            rule,
            weight,
            category,
            detail,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedReputation {
    report: ReputationReport,
    fetched_at: DateTime<Utc>,
}

/// Block decision engine
#[derive(Debug)]
pub struct BlockRuleEngine {
    config: BlockRuleConfig,
    malicious_ips: RwLock<HashSet<IpAddr>>,
    reputation: DashMap<IpAddr, CachedReputation>,
}

impl BlockRuleEngine {
    pub fn new(config: BlockRuleConfig) -> Self {
        let malicious_ips = config.malicious_ips.iter().copied().collect();
        Self {
            config,
            malicious_ips: RwLock::new(malicious_ips),
            reputation: DashMap::new(),
        }
    }

    pub fn add_malicious_ip(&self, ip: IpAddr) {
        self.malicious_ips.write().insert(ip);
    }

    pub fn remove_malicious_ip(&self, ip: IpAddr) -> bool {
        self.malicious_ips.write().remove(&ip)
    }

    /// Stores a reputation verdict, e.g. from a background refresh.
    pub fn record_reputation(
        &self,
        ip: IpAddr,
        report: ReputationReport,
        fetched_at: DateTime<Utc>,
    ) {
        self.reputation.insert(ip, CachedReputation { report, fetched_at });
    }

    /// Cached verdict that has not outlived the cache TTL
    pub fn cached_reputation(&self, ip: IpAddr, now: DateTime<Utc>) -> Option<ReputationReport> {
        let ttl = Duration::seconds(self.config.reputation_cache_ttl_secs);
        self.reputation
            .get(&ip)
            .filter(|cached| now - cached.fetched_at <= ttl)
            .map(|cached| cached.report.clone())
    }

    /// Looks the address up and caches the result. A failed lookup leaves the
    /// address unknown.
    pub async fn refresh_reputation(
        &self,
        lookup: &dyn ReputationLookup,
        ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Option<ReputationReport> {
        match lookup.lookup(ip).await {
            Ok(report) => {
                debug!("Reputation for {}: score {}", ip, report.score);
                self.record_reputation(ip, report.clone(), now);
                Some(report)
            }
            Err(e) => {
                warn!("Reputation lookup for {} failed, treating as unknown: {}", ip, e);
                None
            }
        }
    }

    /// Drops cached verdicts older than the TTL
    pub fn prune_reputation(&self, now: DateTime<Utc>) -> usize {
        let ttl = Duration::seconds(self.config.reputation_cache_ttl_secs);
        let before = self.reputation.len();
        self.reputation.retain(|_, cached| now - cached.fetched_at <= ttl);
        before - self.reputation.len()
    }

    pub fn evaluate(&self, fact: &ConnectionFact) -> BlockDecision {
        let now = fact.observed_at;

        if let Some(reason) = self.whitelist_reason(fact) {
            debug!("Allowing {}: {}", fact.remote_ip, reason);
            return BlockDecision::allow(reason, now);
        }

        let tiers: [(BlockLevel, fn(&Self, &ConnectionFact) -> Vec<RuleHit>); 3] = [
            (BlockLevel::Immediate, Self::immediate_rules),
            (BlockLevel::Warning, Self::warning_rules),
            (BlockLevel::Monitor, Self::monitor_rules),
        ];
        for (level, rules) in tiers {
            let hits = rules(self, fact);
            if !hits.is_empty() {
                let decision = decide(level, hits, now);
                if level == BlockLevel::Immediate {
                    info!(
                        "Immediate block for {} (score {:.2}): {}",
                        fact.remote_ip, decision.confidence_score, decision.reason
                    );
                }
                return decision;
            }
        }

        BlockDecision::allow("No rules triggered", now)
    }

    fn whitelist_reason(&self, fact: &ConnectionFact) -> Option<String> {
        if is_internal_address(&fact.remote_ip) {
            return Some(format!("Internal address {} is whitelisted", fact.remote_ip));
        }
        let path = fact.executable_path.as_deref()?.to_lowercase();
        self.config
            .system_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
            .then(|| format!("System binary {} is whitelisted", path))
    }

    fn is_known_malicious(&self, fact: &ConnectionFact) -> Option<String> {
        if self.malicious_ips.read().contains(&fact.remote_ip) {
            return Some(format!("{} is on the malicious address list", fact.remote_ip));
        }
        let report = self.cached_reputation(fact.remote_ip, fact.observed_at)?;
        (report.score >= self.config.malicious_score_threshold).then(|| {
            format!(
                "{} has reputation score {} ({})",
                fact.remote_ip,
                report.score,
                report.categories.join(", ")
            )
        })
    }

    fn immediate_rules(&self, fact: &ConnectionFact) -> Vec<RuleHit> {
        let mut hits = Vec::new();

        if let Some(detail) = self.is_known_malicious(fact) {
            hits.push(RuleHit::new("MaliciousIp", 0.9, "Malware Communication", detail));
        }

        if let Some(port) = fact.remote_port {
            if self.config.suspicious_ports.contains(&port)
                && !self.config.legitimate_ports.contains(&port)
            {
                hits.push(RuleHit::new(
                    "SuspiciousPort",
                    0.8,
                    "Suspicious Port",
                    format!("connection to port {}", port),
                ));
            }
        }

        if let Some(name) = &fact.process_name {
            let lower = name.to_lowercase();
            if self.config.protected_process_names.iter().any(|p| *p == lower) {
                let has_image = fact
                    .executable_path
                    .as_deref()
                    .map_or(false, |path| path.to_lowercase().contains(".exe"));
                if fact.process_id != Some(0) || has_image {
                    hits.push(RuleHit::new(
                        "ProcessForgery",
                        1.0,
                        "Process Impersonation",
                        format!("{} running as PID {:?}", name, fact.process_id),
                    ));
                }
            }
        }

        let transfer_limit = self.config.abnormal_transfer_mb * BYTES_PER_MB;
        if fact.bytes_transferred >= transfer_limit {
            hits.push(RuleHit::new(
                "AbnormalTransfer",
                0.7,
                "Data Exfiltration",
                format!("{} MB transferred", fact.bytes_transferred / BYTES_PER_MB),
            ));
        }

        if let Some(path) = &fact.executable_path {
            let lower = path.to_lowercase();
            if self
                .config
                .suspicious_path_fragments
                .iter()
                .any(|fragment| lower.contains(fragment.as_str()))
            {
                hits.push(RuleHit::new(
                    "SuspiciousPath",
                    0.85,
                    "Suspicious Executable",
                    format!("executable at {}", path),
                ));
            }
        }

        hits
    }

    fn warning_rules(&self, fact: &ConnectionFact) -> Vec<RuleHit> {
        let mut hits = Vec::new();

        if fact.connections_last_minute >= self.config.network_pattern_threshold {
            hits.push(RuleHit::new(
                "SuspiciousNetworkPattern",
                0.6,
                "Suspicious Network Activity",
                format!("{} connections in the last minute", fact.connections_last_minute),
            ));
        }

        if fact.is_signed == Some(false) {
            hits.push(RuleHit::new(
                "UnsignedExecutable",
                0.5,
                "Unverified Software",
                "executable is not signed".to_string(),
            ));
        }

        if let Some(country) = &fact.remote_country {
            if self
                .config
                .restricted_countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(country))
            {
                hits.push(RuleHit::new(
                    "RestrictedCountry",
                    0.6,
                    "Geo Restriction",
                    format!("destination in {}", country),
                ));
            }
        }

        let hour = self.local_hour(fact.observed_at);
        if (self.config.unusual_hours_start..self.config.unusual_hours_end).contains(&hour) {
            hits.push(RuleHit::new(
                "UnusualHour",
                0.3,
                "Unusual Activity Time",
                format!("activity at {:02}:00 local time", hour),
            ));
        }

        hits
    }

    fn monitor_rules(&self, fact: &ConnectionFact) -> Vec<RuleHit> {
        let mut hits = Vec::new();

        if let Some(first_seen) = fact.program_first_seen {
            let window = Duration::hours(self.config.new_program_window_hours);
            if fact.observed_at - first_seen < window {
                hits.push(RuleHit::new(
                    "NewProgram",
                    0.3,
                    "New Program",
                    format!("program first seen at {}", first_seen),
                ));
            }
        }

        if let Some(port) = fact.remote_port {
            // Ephemeral ports are the client side of ordinary traffic.
            if port < 49152 && !self.config.legitimate_ports.contains(&port) {
                hits.push(RuleHit::new(
                    "NonStandardPort",
                    0.2,
                    "Non-standard Port",
                    format!("remote port {}", port),
                ));
            }
        }

        if let Some(std_dev) = fact.connection_interval_std_dev_ms {
            if std_dev < self.config.periodic_max_std_dev_ms {
                hits.push(RuleHit::new(
                    "PeriodicTiming",
                    0.4,
                    "Possible Botnet Beacon",
                    format!("connection interval std dev {:.1}ms", std_dev),
                ));
            }
        }

        if fact.is_elevated {
            hits.push(RuleHit::new(
                "ElevatedPrivileges",
                0.3,
                "Privileged Process",
                "process runs elevated".to_string(),
            ));
        }

        hits
    }

    fn local_hour(&self, at: DateTime<Utc>) -> u32 {
        match FixedOffset::east_opt(self.config.utc_offset_minutes * 60) {
            Some(offset) => at.with_timezone(&offset).hour(),
            None => at.hour(),
        }
    }
}

fn decide(level: BlockLevel, hits: Vec<RuleHit>, analyzed_at: DateTime<Utc>) -> BlockDecision {
    let threat_category = hits
        .first()
        .map(|hit| hit.category.to_string())
        .unwrap_or_default();
    BlockDecision {
        level,
        reason: hits.iter().map(|hit| hit.detail.as_str()).collect::<Vec<_>>().join("; "),
        confidence_score: hits.iter().map(|hit| hit.weight).sum(),
        triggered_rules: hits.iter().map(|hit| hit.rule.to_string()).collect(),
        threat_category,
        recommended_action: level.recommended_action().to_string(),
        analyzed_at,
    }
}
