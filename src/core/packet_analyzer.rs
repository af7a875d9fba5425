//! Composed per-batch packet analysis.
//!
//! Feeds every packet through the flow, TCP and UDP trackers and the size
//! analyzer, then evaluates signatures over a retained window of recent
//! packets. Trackers live in concurrent maps with one mutex per tracker.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::alert::{AdvancedDdosAlert, AttackType, DdosAlert, Severity};
use crate::core::flow::{
    FlagAnomaly, FlowTracker, TcpConnectionAnalyzer, TcpConnectionState, UdpSessionAnalyzer,
};
use crate::core::packet::{ConnectionKey, FlowKey, PacketRecord, Protocol};
use crate::core::signatures::{SignatureEngine, SignatureFailure, SignatureMatch, SignatureScan};
use crate::core::size_distribution::{PacketSizeDistributionAnalyzer, SizeAnomalyKind};
use crate::utils::exceed_score;

/// Packet analyzer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Packets per second on a single flow
    pub flow_rate_threshold: f64,
    pub fragmentation_ratio_threshold: f64,
    /// Windowed packets a flow needs before its fragmentation ratio counts
    pub fragmentation_min_packets: usize,
    /// Packets per second on a single UDP session
    pub udp_rate_threshold: f64,
    /// Bytes per second on a single UDP session
    pub udp_bandwidth_threshold: u64,
    /// Trackers idle for longer than this are evicted
    pub idle_timeout_secs: i64,
    /// How far back signatures look
    pub signature_window_secs: i64,
    pub max_retained_packets: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            flow_rate_threshold: 100.0,
            fragmentation_ratio_threshold: 0.9,
            fragmentation_min_packets: 50,
            udp_rate_threshold: 200.0,
            udp_bandwidth_threshold: 5 * 1024 * 1024,
            idle_timeout_secs: 300,
            signature_window_secs: 60,
            max_retained_packets: 50_000,
        }
    }
}

/// Output of one [`AdvancedPacketAnalyzer::analyze_batch`] call
#[derive(Debug, Clone, Default)]
pub struct BatchAnalysis {
    pub packets_analyzed: usize,
    pub alerts: Vec<AdvancedDdosAlert>,
    pub signature_matches: Vec<SignatureMatch>,
    pub signature_failures: Vec<SignatureFailure>,
    /// UDP sessions and ICMP/other flows first seen in this batch
    pub opened_flows: HashSet<FlowKey>,
}

/// Advanced packet analyzer
pub struct AdvancedPacketAnalyzer {
    config: AnalyzerConfig,
    flows: DashMap<FlowKey, Arc<Mutex<FlowTracker>>>,
    tcp_connections: DashMap<ConnectionKey, Arc<Mutex<TcpConnectionAnalyzer>>>,
    udp_sessions: DashMap<FlowKey, Arc<Mutex<UdpSessionAnalyzer>>>,
    sizes: PacketSizeDistributionAnalyzer,
    signatures: Arc<SignatureEngine>,
    recent: Mutex<VecDeque<PacketRecord>>,
}

impl AdvancedPacketAnalyzer {
    pub fn new(config: AnalyzerConfig, signatures: Arc<SignatureEngine>) -> Self {
        Self {
            config,
            flows: DashMap::new(),
            tcp_connections: DashMap::new(),
            udp_sessions: DashMap::new(),
            sizes: PacketSizeDistributionAnalyzer::new(),
            signatures,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn signatures(&self) -> &Arc<SignatureEngine> {
        &self.signatures
    }

    pub fn size_analyzer(&self) -> &PacketSizeDistributionAnalyzer {
        &self.sizes
    }

    pub fn analyze_batch(&self, packets: &[PacketRecord], now: DateTime<Utc>) -> BatchAnalysis {
        let mut touched_flows = HashSet::new();
        let mut touched_udp = HashSet::new();
        let mut sources = HashSet::new();
        let mut opened_flows = HashSet::new();
        // BTreeMap keeps alert order stable across runs.
        let mut tcp_anomalies: BTreeMap<String, (ConnectionKey, Vec<FlagAnomaly>)> =
            BTreeMap::new();

        for packet in packets {
            let flow_key = FlowKey::from_packet(packet);
            let (flow, new_flow) = self.flow_tracker(flow_key, packet.timestamp);
            flow.lock().add_packet(packet);
            touched_flows.insert(flow_key);
            sources.insert(packet.src_ip);

            match packet.protocol {
                Protocol::Tcp => {
                    let key = ConnectionKey::from_packet(packet);
                    let tracker = self.tcp_analyzer(key, packet.timestamp);
                    let analysis = tracker.lock().analyze_flags(packet);
                    if analysis.is_anomalous() {
                        let entry = tcp_anomalies
                            .entry(key.to_string())
                            .or_insert_with(|| (key, Vec::new()));
                        for anomaly in analysis.anomalies {
                            if !entry.1.iter().any(|seen| same_kind(seen, &anomaly)) {
                                entry.1.push(anomaly);
                            }
                        }
                    }
                }
                Protocol::Udp => {
                    let (session, new_session) = self.udp_session(flow_key, packet.timestamp);
                    session.lock().add_packet(packet);
                    if new_session {
                        opened_flows.insert(flow_key);
                    }
                    touched_udp.insert(flow_key);
                }
                Protocol::Icmp | Protocol::Other => {
                    if new_flow {
                        opened_flows.insert(flow_key);
                    }
                }
            }

            self.sizes
                .add_packet(packet.src_ip, packet.length, packet.protocol, packet.timestamp);
        }

        let mut alerts = Vec::new();
        for (key, anomalies) in tcp_anomalies.into_values() {
            alerts.push(tcp_anomaly_alert(key, &anomalies, now));
        }
        alerts.extend(self.flow_alerts(&touched_flows, now));
        alerts.extend(self.udp_alerts(&touched_udp, now));
        alerts.extend(self.size_alerts(&sources, now));

        let scan = self.scan_signatures(packets, now);
        for signature_match in &scan.matches {
            match signature_alert(signature_match, now) {
                Some(alert) => alerts.push(alert),
                None => debug!(
                    "Signature {} matched without a source",
                    signature_match.signature_id
                ),
            }
        }

        BatchAnalysis {
            packets_analyzed: packets.len(),
            alerts,
            signature_matches: scan.matches,
            signature_failures: scan.failures,
            opened_flows,
        }
    }

    /// Get-or-create; the flag is `true` when this call created the tracker.
    fn flow_tracker(
        &self,
        key: FlowKey,
        first_seen: DateTime<Utc>,
    ) -> (Arc<Mutex<FlowTracker>>, bool) {
        let mut created = false;
        let tracker = self
            .flows
            .entry(key)
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(FlowTracker::new(key, first_seen)))
            })
            .clone();
        (tracker, created)
    }

    fn tcp_analyzer(
        &self,
        key: ConnectionKey,
        first_seen: DateTime<Utc>,
    ) -> Arc<Mutex<TcpConnectionAnalyzer>> {
        self.tcp_connections
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(TcpConnectionAnalyzer::new(key, first_seen))))
            .clone()
    }

    fn udp_session(
        &self,
        key: FlowKey,
        first_seen: DateTime<Utc>,
    ) -> (Arc<Mutex<UdpSessionAnalyzer>>, bool) {
        let mut created = false;
        let session = self
            .udp_sessions
            .entry(key)
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(UdpSessionAnalyzer::new(key, first_seen)))
            })
            .clone();
        (session, created)
    }

    fn flow_alerts(
        &self,
        touched: &HashSet<FlowKey>,
        now: DateTime<Utc>,
    ) -> Vec<AdvancedDdosAlert> {
        let mut alerts = Vec::new();
        for key in touched {
            let Some(tracker) = self.flows.get(key).map(|t| t.clone()) else { continue };
            let tracker = tracker.lock();

            let pps = tracker.packets_per_second(now);
            if pps > self.config.flow_rate_threshold {
                let alert = DdosAlert::new(
                    AttackType::HighTrafficRate,
                    Severity::from_ratio(pps, self.config.flow_rate_threshold),
                    key.src_ip,
                    format!("{:.0} packets/s on flow {}", pps, key),
                    now,
                )
                .with_destination(Some(key.dst_ip))
                .with_counts(tracker.total_packets(), 1, tracker.total_bytes());
                let confidence = exceed_score(pps, self.config.flow_rate_threshold);
                alerts.push(
                    AdvancedDdosAlert::new(alert, confidence)
                        .with_flow(key)
                        .with_evidence(format!("flow rate {:.0} packets/s", pps)),
                );
            }

            let ratio = tracker.fragmentation_ratio();
            if tracker.window_len() >= self.config.fragmentation_min_packets
                && ratio > self.config.fragmentation_ratio_threshold
            {
                let alert = DdosAlert::new(
                    AttackType::Fragmentation,
                    Severity::Medium,
                    key.src_ip,
                    format!("{:.0}% small packets on flow {}", ratio * 100.0, key),
                    now,
                )
                .with_destination(Some(key.dst_ip))
                .with_counts(tracker.total_packets(), 1, tracker.total_bytes());
                alerts.push(
                    AdvancedDdosAlert::new(alert, ratio * 100.0)
                        .with_flow(key)
                        .with_evidence(format!("fragmentation ratio {:.2}", ratio)),
                );
            }
        }
        alerts
    }

    fn udp_alerts(&self, touched: &HashSet<FlowKey>, now: DateTime<Utc>) -> Vec<AdvancedDdosAlert> {
        let mut alerts = Vec::new();
        for key in touched {
            let Some(session) = self.udp_sessions.get(key).map(|s| s.clone()) else { continue };
            let session = session.lock();

            let pps = session.packets_per_second(now);
            let bps = session.bytes_per_second(now);
            let (attack_type, observed, threshold) = if pps > self.config.udp_rate_threshold {
                (AttackType::UdpFlood, pps, self.config.udp_rate_threshold)
            } else if bps > self.config.udp_bandwidth_threshold {
                (AttackType::BandwidthFlood, bps as f64, self.config.udp_bandwidth_threshold as f64)
            } else {
                continue;
            };

            let alert = DdosAlert::new(
                attack_type,
                Severity::from_ratio(observed, threshold),
                key.src_ip,
                format!("UDP session {}: {:.0} packets/s, {} bytes/s", key, pps, bps),
                now,
            )
            .with_destination(Some(key.dst_ip))
            .with_counts(session.packet_count(), 1, session.byte_count());
            alerts.push(
                AdvancedDdosAlert::new(alert, exceed_score(observed, threshold))
                    .with_flow(key)
                    .with_evidence(format!(
                        "average packet size {:.0} bytes",
                        session.average_packet_size()
                    )),
            );
        }
        alerts
    }

    fn size_alerts(&self, sources: &HashSet<IpAddr>, now: DateTime<Utc>) -> Vec<AdvancedDdosAlert> {
        self.sizes
            .detect_anomalies(now)
            .into_iter()
            .filter(|anomaly| sources.contains(&anomaly.source_ip))
            .map(|anomaly| {
                let (severity, confidence) = match anomaly.kind {
                    SizeAnomalyKind::UniformSize => (Severity::Medium, 70.0),
                    SizeAnomalyKind::ExcessivelyLarge => (Severity::Medium, 60.0),
                    SizeAnomalyKind::ExcessivelySmall => (Severity::High, 75.0),
                };
                let alert = DdosAlert::new(
                    AttackType::PacketSizeAnomaly,
                    severity,
                    anomaly.source_ip,
                    format!("{} from {}", anomaly.kind, anomaly.source_ip),
                    now,
                )
                .with_counts(anomaly.sample_count as u64, 0, 0);
                AdvancedDdosAlert::new(alert, confidence).with_evidence(format!(
                    "{} {} samples: mean {:.1}, std dev {:.1}, range {}-{}",
                    anomaly.sample_count,
                    anomaly.dominant_protocol,
                    anomaly.mean,
                    anomaly.std_dev,
                    anomaly.min,
                    anomaly.max
                ))
            })
            .collect()
    }

    fn scan_signatures(&self, packets: &[PacketRecord], now: DateTime<Utc>) -> SignatureScan {
        let mut recent = self.recent.lock();
        recent.extend(packets.iter().cloned());

        let cutoff = now - Duration::seconds(self.config.signature_window_secs);
        while let Some(front) = recent.front() {
            if front.timestamp <= cutoff || recent.len() > self.config.max_retained_packets {
                recent.pop_front();
            } else {
                break;
            }
        }

        self.signatures.evaluate(recent.make_contiguous(), now)
    }

    /// Evicts trackers with no traffic inside the idle horizon.
    pub fn cleanup_idle(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(self.config.idle_timeout_secs);
        let before = self.flows.len() + self.tcp_connections.len() + self.udp_sessions.len();

        self.flows.retain(|_, tracker| tracker.lock().last_seen() >= cutoff);
        self.tcp_connections.retain(|_, analyzer| analyzer.lock().last_seen() >= cutoff);
        self.udp_sessions.retain(|_, session| session.lock().last_seen() >= cutoff);
        let after = self.flows.len() + self.tcp_connections.len() + self.udp_sessions.len();
        let removed = before - after;
        let sources = self.sizes.cleanup(now);

        if removed > 0 || sources > 0 {
            info!("Analyzer sweep evicted {} trackers and {} size sources", removed, sources);
        }
        removed
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn tcp_connection_count(&self) -> usize {
        self.tcp_connections.len()
    }

    pub fn udp_session_count(&self) -> usize {
        self.udp_sessions.len()
    }

    pub fn tcp_state(&self, key: &ConnectionKey) -> Option<TcpConnectionState> {
        self.tcp_connections.get(key).map(|analyzer| analyzer.lock().state())
    }

    pub fn retained_packets(&self) -> usize {
        self.recent.lock().len()
    }
}

fn same_kind(a: &FlagAnomaly, b: &FlagAnomaly) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn tcp_anomaly_alert(
    key: ConnectionKey,
    anomalies: &[FlagAnomaly],
    now: DateTime<Utc>,
) -> AdvancedDdosAlert {
    let attack_type = if anomalies.iter().any(|a| matches!(a, FlagAnomaly::UnmatchedSyn { .. })) {
        AttackType::SynFlood
    } else if anomalies.iter().any(|a| matches!(a, FlagAnomaly::RstFlood { .. })) {
        AttackType::RstFlood
    } else {
        AttackType::TcpFlagAnomaly
    };
    let severity = if attack_type == AttackType::TcpFlagAnomaly {
        Severity::Medium
    } else {
        Severity::High
    };
    let confidence = (50.0 + 15.0 * anomalies.len() as f64).min(100.0);

    let alert = DdosAlert::new(
        attack_type,
        severity,
        key.src_ip,
        format!("TCP flag anomalies on {}", key),
        now,
    )
    .with_destination(Some(key.dst_ip))
    .with_counts(0, 1, 0);

    anomalies
        .iter()
        .fold(AdvancedDdosAlert::new(alert, confidence).with_flow(key), |alert, anomaly| {
            alert.with_evidence(anomaly.to_string())
        })
}

fn signature_alert(
    signature_match: &SignatureMatch,
    now: DateTime<Utc>,
) -> Option<AdvancedDdosAlert> {
    let source = signature_match.source_ip?;
    let alert = DdosAlert::new(
        signature_match.attack_type,
        signature_match.severity,
        source,
        format!("Signature {} matched", signature_match.signature_name),
        now,
    );
    let advanced = AdvancedDdosAlert::new(alert, signature_match.score)
        .with_signature(&signature_match.signature_id);
    Some(
        signature_match
            .details
            .iter()
            .fold(advanced, |alert, detail| alert.with_evidence(detail.clone())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::TcpFlags;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn analyzer() -> AdvancedPacketAnalyzer {
        let signatures = Arc::new(SignatureEngine::with_defaults());
        AdvancedPacketAnalyzer::new(AnalyzerConfig::default(), signatures)
    }

    fn tcp(ms: i64, src_port: u16, flags: TcpFlags) -> PacketRecord {
        PacketRecord::tcp(
            base() + Duration::milliseconds(ms),
            (ip("203.0.113.9"), src_port),
            (ip("10.0.0.1"), 80),
            60,
            flags,
        )
    }

    #[test]
    fn one_tracker_per_key() {
        let analyzer = analyzer();
        let packets: Vec<PacketRecord> = (0..5).map(|i| tcp(i, 40000, TcpFlags::ACK)).collect();
        analyzer.analyze_batch(&packets, base() + Duration::seconds(1));
        assert_eq!(analyzer.flow_count(), 1);
        assert_eq!(analyzer.tcp_connection_count(), 1);
        assert_eq!(analyzer.udp_session_count(), 0);
    }

    #[test]
    fn handshake_reaches_established() {
        let analyzer = analyzer();
        let packets = vec![
            tcp(0, 40000, TcpFlags::SYN),
            tcp(1, 40000, TcpFlags::SYN | TcpFlags::ACK),
            tcp(2, 40000, TcpFlags::ACK),
        ];
        let analysis = analyzer.analyze_batch(&packets, base() + Duration::seconds(1));
        let key = ConnectionKey::from_packet(&packets[0]);
        assert_eq!(analyzer.tcp_state(&key), Some(TcpConnectionState::Established));
        assert!(analysis.alerts.is_empty());

        analyzer.analyze_batch(&[tcp(3, 40000, TcpFlags::RST)], base() + Duration::seconds(1));
        assert_eq!(analyzer.tcp_state(&key), Some(TcpConnectionState::Closed));
    }

    #[test]
    fn repeated_syns_on_one_connection_raise_one_alert() {
        let analyzer = analyzer();
        let packets: Vec<PacketRecord> =
            (0..12).map(|i| tcp(i * 10, 40000, TcpFlags::SYN)).collect();
        let analysis = analyzer.analyze_batch(&packets, base() + Duration::seconds(1));

        let tcp_alerts: Vec<_> = analysis
            .alerts
            .iter()
            .filter(|a| a.alert.attack_type == AttackType::SynFlood && a.signature_id.is_none())
            .collect();
        assert_eq!(tcp_alerts.len(), 1);
        assert_eq!(tcp_alerts[0].alert.severity, Severity::High);
        assert!(tcp_alerts[0].evidence.iter().any(|e| e.contains("unmatched SYN")));
        assert!(tcp_alerts[0].evidence.iter().any(|e| e.contains("SYN ratio")));
    }

    #[test]
    fn invalid_flag_combination_is_flagged() {
        let analyzer = analyzer();
        let packet = tcp(0, 40000, TcpFlags::SYN | TcpFlags::FIN);
        let analysis = analyzer.analyze_batch(&[packet], base() + Duration::seconds(1));
        assert_eq!(analysis.alerts.len(), 1);
        assert_eq!(analysis.alerts[0].alert.attack_type, AttackType::TcpFlagAnomaly);
    }

    #[test]
    fn busy_flow_raises_rate_alert() {
        let analyzer = analyzer();
        let packets: Vec<PacketRecord> = (0..150)
            .map(|i| tcp(i * 5, 40000, TcpFlags::ACK | TcpFlags::PSH))
            .collect();
        let analysis = analyzer.analyze_batch(&packets, base() + Duration::milliseconds(800));
        let rate = analysis
            .alerts
            .iter()
            .find(|a| a.alert.attack_type == AttackType::HighTrafficRate)
            .expect("flow above 100 packets/s");
        assert_eq!(rate.alert.source_ip, ip("203.0.113.9"));
        assert!(rate.flow.as_deref().unwrap_or_default().contains("203.0.113.9:40000"));
    }

    #[test]
    fn uniform_sizes_raise_size_alert() {
        let analyzer = analyzer();
        let packets: Vec<PacketRecord> = (0..60)
            .map(|i| {
                PacketRecord::udp(
                    base() + Duration::milliseconds(i * 37 % 1000),
                    (ip("198.51.100.77"), 5000 + i as u16),
                    (ip("10.0.0.1"), 9000),
                    64,
                )
            })
            .collect();
        let analysis = analyzer.analyze_batch(&packets, base() + Duration::seconds(1));
        assert!(analysis.alerts.iter().any(|a| {
            a.alert.attack_type == AttackType::PacketSizeAnomaly
                && a.alert.source_ip == ip("198.51.100.77")
        }));
    }

    #[test]
    fn signatures_see_packets_from_earlier_batches() {
        let analyzer = analyzer();
        let first: Vec<PacketRecord> =
            (0..60).map(|i| tcp(i * 10, 1000 + i as u16, TcpFlags::SYN)).collect();
        let analysis = analyzer.analyze_batch(&first, base() + Duration::seconds(1));
        assert!(!analysis
            .signature_matches
            .iter()
            .any(|m| m.signature_id == "SIG-SYN-FLOOD"));

        let second: Vec<PacketRecord> = (0..60)
            .map(|i| tcp(1000 + i * 10, 2000 + i as u16, TcpFlags::SYN))
            .collect();
        let analysis = analyzer.analyze_batch(&second, base() + Duration::seconds(2));
        let syn = analysis
            .alerts
            .iter()
            .find(|a| a.signature_id.as_deref() == Some("SIG-SYN-FLOOD"))
            .expect("120 SYNs in the retained window");
        assert_eq!(syn.alert.source_ip, ip("203.0.113.9"));
        assert_eq!(analyzer.retained_packets(), 120);
    }

    #[test]
    fn only_first_sight_of_a_session_opens_a_flow() {
        let analyzer = analyzer();
        let voice = |ms: i64| {
            PacketRecord::udp(
                base() + Duration::milliseconds(ms),
                (ip("203.0.113.40"), 5004),
                (ip("10.0.0.1"), 3478),
                172,
            )
        };
        let ping = PacketRecord::icmp(base(), ip("203.0.113.41"), ip("10.0.0.1"), 84);

        let first: Vec<PacketRecord> =
            (0..20).map(|i| voice(i * 20)).chain([ping.clone()]).collect();
        let analysis = analyzer.analyze_batch(&first, base() + Duration::seconds(1));
        assert_eq!(analysis.opened_flows.len(), 2);
        assert!(analysis.opened_flows.contains(&FlowKey::from_packet(&first[0])));
        assert!(analysis.opened_flows.contains(&FlowKey::from_packet(&ping)));

        let second: Vec<PacketRecord> = (20..40).map(voice).chain([ping]).collect();
        let analysis = analyzer.analyze_batch(&second, base() + Duration::seconds(2));
        assert!(analysis.opened_flows.is_empty());

        let syn = tcp(900, 41000, TcpFlags::SYN);
        let syn = analyzer.analyze_batch(&[syn], base() + Duration::seconds(2));
        assert!(syn.opened_flows.is_empty());
    }

    #[test]
    fn idle_trackers_are_evicted() {
        let analyzer = analyzer();
        analyzer.analyze_batch(&[tcp(0, 40000, TcpFlags::SYN)], base());
        analyzer.analyze_batch(
            &[PacketRecord::udp(base(), (ip("198.51.100.1"), 53), (ip("10.0.0.1"), 5353), 120)],
            base(),
        );
        assert_eq!(analyzer.flow_count(), 2);

        assert_eq!(analyzer.cleanup_idle(base() + Duration::minutes(1)), 0);
        assert_eq!(analyzer.cleanup_idle(base() + Duration::minutes(6)), 4);
        assert_eq!(analyzer.flow_count(), 0);
        assert_eq!(analyzer.size_analyzer().tracked_sources(), 0);
    }
}
