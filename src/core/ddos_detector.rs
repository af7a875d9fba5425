//! Threshold-based DDoS detectors.
//!
//! Detectors are stateless per call: each one groups a connection or packet
//! batch by source IP and raises an alert for every source above its
//! threshold. Severity follows the observed/threshold ratio.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::alert::{AttackType, DdosAlert, Severity};
use crate::core::packet::{ConnectionRecord, ConnectionState, PacketRecord, Protocol};
use crate::utils::within_window;

const WEB_PORTS: [u16; 2] = [80, 443];

/// Errors that can occur during DDoS detection
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Invalid threshold {name}: {value}")]
    InvalidThreshold { name: &'static str, value: f64 },
}

/// DDoS detection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DdosDetectionConfig {
    /// Half-open connections, or SYN packets per second, per source
    pub syn_flood_threshold: u32,
    /// UDP connections or packets per second per source
    pub udp_flood_threshold: u32,
    /// ICMP packets per second per source
    pub icmp_flood_threshold: u32,
    /// New connections per second per source, any protocol
    pub connection_flood_threshold: u32,
    /// New connections to web ports per second per source
    pub http_flood_threshold: u32,
    /// Bytes per second per source
    pub bandwidth_threshold: u64,
    pub slowloris_min_connections: u32,
    pub slowloris_min_age_secs: i64,
    pub slowloris_max_bytes: u64,
    /// Trailing window for the per-second detectors
    pub rate_window_secs: i64,
}

impl Default for DdosDetectionConfig {
    fn default() -> Self {
        Self {
            syn_flood_threshold: 100,
            udp_flood_threshold: 500,
            icmp_flood_threshold: 100,
            connection_flood_threshold: 200,
            http_flood_threshold: 100,
            bandwidth_threshold: 10 * 1024 * 1024, // 10 MB/s
            slowloris_min_connections: 10,
            slowloris_min_age_secs: 10,
            slowloris_max_bytes: 1024,
            rate_window_secs: 1,
        }
    }
}

impl DdosDetectionConfig {
    pub fn validate(&self) -> Result<(), DetectionError> {
        let checks: [(&'static str, f64); 10] = [
            ("syn_flood_threshold", f64::from(self.syn_flood_threshold)),
            ("udp_flood_threshold", f64::from(self.udp_flood_threshold)),
            ("icmp_flood_threshold", f64::from(self.icmp_flood_threshold)),
            ("connection_flood_threshold", f64::from(self.connection_flood_threshold)),
            ("http_flood_threshold", f64::from(self.http_flood_threshold)),
            ("bandwidth_threshold", self.bandwidth_threshold as f64),
            ("slowloris_min_connections", f64::from(self.slowloris_min_connections)),
            ("slowloris_min_age_secs", self.slowloris_min_age_secs as f64),
            ("slowloris_max_bytes", self.slowloris_max_bytes as f64),
            ("rate_window_secs", self.rate_window_secs as f64),
        ];
        match checks.iter().find(|(_, value)| *value <= 0.0) {
            Some((name, value)) => Err(DetectionError::InvalidThreshold {
                name: *name,
                value: *value,
            }),
            None => Ok(()),
        }
    }
}

/// Per-source tallies for one detector, ordered by address
#[derive(Default)]
struct SourceTally {
    count: u64,
    bytes: u64,
    destination: Option<IpAddr>,
}

fn tally<'a, T: 'a>(
    items: impl Iterator<Item = &'a T>,
    key: impl Fn(&T) -> (IpAddr, IpAddr, u64),
) -> BTreeMap<IpAddr, SourceTally> {
    let mut tallies: BTreeMap<IpAddr, SourceTally> = BTreeMap::new();
    for item in items {
        let (source, destination, bytes) = key(item);
        let entry = tallies.entry(source).or_default();
        entry.count += 1;
        entry.bytes += bytes;
        entry.destination.get_or_insert(destination);
    }
    tallies
}

/// DDoS detection engine
#[derive(Debug)]
pub struct DdosDetectionEngine {
    config: RwLock<DdosDetectionConfig>,
}

impl DdosDetectionEngine {
    /// Create a new detection engine, rejecting non-positive thresholds
    pub fn new(config: DdosDetectionConfig) -> Result<Self, DetectionError> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
        })
    }

    /// Replaces the thresholds. An invalid configuration is rejected and the
    /// previous one stays active.
    pub fn update_config(&self, config: DdosDetectionConfig) -> Result<(), DetectionError> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    pub fn config(&self) -> DdosDetectionConfig {
        self.config.read().clone()
    }

    /// Runs every connection-level detector over a socket-table snapshot
    pub fn analyze_connections(
        &self,
        connections: &[ConnectionRecord],
        now: DateTime<Utc>,
    ) -> Vec<DdosAlert> {
        let mut alerts = Vec::new();
        alerts.extend(self.detect_syn_flood(connections, now));
        alerts.extend(self.detect_udp_flood(connections, now));
        alerts.extend(self.detect_connection_flood(connections, now));
        alerts.extend(self.detect_http_flood(connections, now));
        alerts.extend(self.detect_slowloris(connections, now));
        alerts.extend(self.detect_bandwidth_flood(connections, now));
        log_alerts(&alerts);
        alerts
    }

    /// Runs every packet-level detector over a captured batch
    pub fn analyze_packets(&self, packets: &[PacketRecord], now: DateTime<Utc>) -> Vec<DdosAlert> {
        let mut alerts = Vec::new();
        alerts.extend(self.detect_packet_syn_flood(packets, now));
        alerts.extend(self.detect_packet_udp_flood(packets, now));
        alerts.extend(self.detect_packet_icmp_flood(packets, now));
        alerts.extend(self.detect_packet_bandwidth_flood(packets, now));
        log_alerts(&alerts);
        alerts
    }

    /// Half-open TCP connections per remote source
    pub fn detect_syn_flood(
        &self,
        connections: &[ConnectionRecord],
        now: DateTime<Utc>,
    ) -> Vec<DdosAlert> {
        let threshold = u64::from(self.config.read().syn_flood_threshold);
        let tallies = tally(
            connections
                .iter()
                .filter(|c| c.protocol == Protocol::Tcp && c.state.is_half_open()),
            |c| (c.remote_ip, c.local_ip, c.total_bytes()),
        );
        threshold_alerts(
            AttackType::SynFlood,
            tallies,
            threshold,
            now,
            "half-open connections",
            true,
        )
    }

    /// UDP sessions opened within the rate window per remote source
    pub fn detect_udp_flood(
        &self,
        connections: &[ConnectionRecord],
        now: DateTime<Utc>,
    ) -> Vec<DdosAlert> {
        let (threshold, window) = {
            let config = self.config.read();
            (u64::from(config.udp_flood_threshold), Duration::seconds(config.rate_window_secs))
        };
        let tallies = tally(
            connections
                .iter()
                .filter(|c| c.protocol == Protocol::Udp && within_window(c.opened_at, now, window)),
            |c| (c.remote_ip, c.local_ip, c.total_bytes()),
        );
        threshold_alerts(AttackType::UdpFlood, tallies, threshold, now, "UDP sessions/s", true)
    }

    /// Connections of any protocol opened within the rate window per remote source
    pub fn detect_connection_flood(
        &self,
        connections: &[ConnectionRecord],
        now: DateTime<Utc>,
    ) -> Vec<DdosAlert> {
        let (threshold, window) = {
            let config = self.config.read();
            (
                u64::from(config.connection_flood_threshold),
                Duration::seconds(config.rate_window_secs),
            )
        };
        let tallies = tally(
            connections.iter().filter(|c| within_window(c.opened_at, now, window)),
            |c| (c.remote_ip, c.local_ip, c.total_bytes()),
        );
        threshold_alerts(
            AttackType::ConnectionFlood,
            tallies,
            threshold,
            now,
            "connections/s",
            true,
        )
    }

    /// Connections to ports 80/443 opened within the rate window per remote source
    pub fn detect_http_flood(
        &self,
        connections: &[ConnectionRecord],
        now: DateTime<Utc>,
    ) -> Vec<DdosAlert> {
        let (threshold, window) = {
            let config = self.config.read();
            (u64::from(config.http_flood_threshold), Duration::seconds(config.rate_window_secs))
        };
        let tallies = tally(
            connections.iter().filter(|c| {
                c.protocol == Protocol::Tcp
                    && WEB_PORTS.contains(&c.local_port)
                    && within_window(c.opened_at, now, window)
            }),
            |c| (c.remote_ip, c.local_ip, c.total_bytes()),
        );
        threshold_alerts(AttackType::HttpFlood, tallies, threshold, now, "web connections/s", true)
    }

    /// Established connections held open with almost no data
    pub fn detect_slowloris(
        &self,
        connections: &[ConnectionRecord],
        now: DateTime<Utc>,
    ) -> Vec<DdosAlert> {
        let config = self.config.read().clone();
        let min_age = Duration::seconds(config.slowloris_min_age_secs);
        let tallies = tally(
            connections.iter().filter(|c| {
                c.protocol == Protocol::Tcp
                    && c.state == ConnectionState::Established
                    && now - c.opened_at > min_age
                    && c.total_bytes() < config.slowloris_max_bytes
            }),
            |c| (c.remote_ip, c.local_ip, c.total_bytes()),
        );
        // Slowloris fires at the threshold, the flood detectors only above it.
        threshold_alerts(
            AttackType::Slowloris,
            tallies,
            u64::from(config.slowloris_min_connections),
            now,
            "slow connections",
            false,
        )
    }

    /// Average bytes per second across each source's connections
    pub fn detect_bandwidth_flood(
        &self,
        connections: &[ConnectionRecord],
        now: DateTime<Utc>,
    ) -> Vec<DdosAlert> {
        let threshold = self.config.read().bandwidth_threshold;
        let mut rates: BTreeMap<IpAddr, (u64, IpAddr, u64, u64)> = BTreeMap::new();
        for c in connections {
            let age_secs = (now - c.opened_at).num_seconds().max(1) as u64;
            let entry = rates.entry(c.remote_ip).or_insert((0, c.local_ip, 0, 0));
            entry.0 += c.total_bytes() / age_secs;
            entry.2 += 1;
            entry.3 += c.total_bytes();
        }
        rates
            .into_iter()
            .filter(|(_, (bps, ..))| *bps > threshold)
            .map(|(source, (bps, destination, count, bytes))| {
                let severity = Severity::from_ratio(bps as f64, threshold as f64);
                DdosAlert::new(
                    AttackType::BandwidthFlood,
                    severity,
                    source,
                    format!(
                        "Bandwidth flood from {}: {} bytes/s (threshold {})",
                        source, bps, threshold
                    ),
                    now,
                )
                .with_destination(Some(destination))
                .with_counts(0, count, bytes)
            })
            .collect()
    }

    /// SYN-only packets per second per source
    pub fn detect_packet_syn_flood(
        &self,
        packets: &[PacketRecord],
        now: DateTime<Utc>,
    ) -> Vec<DdosAlert> {
        let (threshold, window) = self.packet_params(|c| c.syn_flood_threshold);
        let tallies = tally(
            packets.iter().filter(|p| {
                p.protocol == Protocol::Tcp
                    && p.tcp_flags.is_syn_only()
                    && within_window(p.timestamp, now, window)
            }),
            packet_key,
        );
        threshold_alerts(AttackType::SynFlood, tallies, threshold, now, "SYN packets/s", true)
            .into_iter()
            .map(as_packet_alert)
            .collect()
    }

    /// UDP packets per second per source
    pub fn detect_packet_udp_flood(
        &self,
        packets: &[PacketRecord],
        now: DateTime<Utc>,
    ) -> Vec<DdosAlert> {
        let (threshold, window) = self.packet_params(|c| c.udp_flood_threshold);
        let tallies = tally(
            packets
                .iter()
                .filter(|p| p.protocol == Protocol::Udp && within_window(p.timestamp, now, window)),
            packet_key,
        );
        threshold_alerts(AttackType::UdpFlood, tallies, threshold, now, "UDP packets/s", true)
            .into_iter()
            .map(as_packet_alert)
            .collect()
    }

    /// ICMP packets per second per source
    pub fn detect_packet_icmp_flood(
        &self,
        packets: &[PacketRecord],
        now: DateTime<Utc>,
    ) -> Vec<DdosAlert> {
        let (threshold, window) = self.packet_params(|c| c.icmp_flood_threshold);
        let tallies = tally(
            packets
                .iter()
                .filter(|p| {
                    p.protocol == Protocol::Icmp && within_window(p.timestamp, now, window)
                }),
            packet_key,
        );
        threshold_alerts(AttackType::IcmpFlood, tallies, threshold, now, "ICMP packets/s", true)
            .into_iter()
            .map(as_packet_alert)
            .collect()
    }

    /// Captured bytes per second per source
    pub fn detect_packet_bandwidth_flood(
        &self,
        packets: &[PacketRecord],
        now: DateTime<Utc>,
    ) -> Vec<DdosAlert> {
        let (threshold, window_secs) = {
            let config = self.config.read();
            (config.bandwidth_threshold, config.rate_window_secs)
        };
        let window = Duration::seconds(window_secs);
        let mut bytes: HashMap<IpAddr, (u64, u64, IpAddr)> = HashMap::new();
        for p in packets.iter().filter(|p| within_window(p.timestamp, now, window)) {
            let entry = bytes.entry(p.src_ip).or_insert((0, 0, p.dst_ip));
            entry.0 += u64::from(p.length);
            entry.1 += 1;
        }
        let mut alerts: Vec<DdosAlert> = bytes
            .into_iter()
            .filter_map(|(source, (total, count, destination))| {
                let bps = total / window_secs as u64;
                (bps > threshold).then(|| {
                    DdosAlert::new(
                        AttackType::BandwidthFlood,
                        Severity::from_ratio(bps as f64, threshold as f64),
                        source,
                        format!(
                            "Bandwidth flood from {}: {} bytes/s (threshold {})",
                            source, bps, threshold
                        ),
                        now,
                    )
                    .with_destination(Some(destination))
                    .with_counts(count, 0, total)
                })
            })
            .collect();
        alerts.sort_by_key(|a| a.source_ip);
        alerts
    }

    fn packet_params(&self, threshold: impl Fn(&DdosDetectionConfig) -> u32) -> (u64, Duration) {
        let config = self.config.read();
        (u64::from(threshold(&config)), Duration::seconds(config.rate_window_secs))
    }
}

fn packet_key(p: &PacketRecord) -> (IpAddr, IpAddr, u64) {
    (p.src_ip, p.dst_ip, u64::from(p.length))
}

/// Packet detectors count packets rather than connections.
fn as_packet_alert(alert: DdosAlert) -> DdosAlert {
    let (connections, bytes) = (alert.connection_count, alert.byte_count);
    alert.with_counts(connections, 0, bytes)
}

fn threshold_alerts(
    attack_type: AttackType,
    tallies: BTreeMap<IpAddr, SourceTally>,
    threshold: u64,
    now: DateTime<Utc>,
    unit: &str,
    strictly_above: bool,
) -> Vec<DdosAlert> {
    tallies
        .into_iter()
        .filter(|(_, t)| if strictly_above { t.count > threshold } else { t.count >= threshold })
        .map(|(source, t)| {
            let severity = Severity::from_ratio(t.count as f64, threshold as f64);
            DdosAlert::new(
                attack_type,
                severity,
                source,
                format!(
                    "{} from {}: {} {} (threshold {})",
                    attack_type, source, t.count, unit, threshold
                ),
                now,
            )
            .with_destination(t.destination)
            .with_counts(0, t.count, t.bytes)
        })
        .collect()
}

fn log_alerts(alerts: &[DdosAlert]) {
    for alert in alerts {
        warn!("{} ({:?}): {}", alert.attack_type, alert.severity, alert.description);
    }
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

    fn connection(
        remote: &str,
        protocol: Protocol,
        local_port: u16,
        state: ConnectionState,
        opened_at: DateTime<Utc>,
    ) -> ConnectionRecord {
        ConnectionRecord {
            protocol,
            local_ip: ip("10.0.0.1"),
            local_port,
            remote_ip: ip(remote),
            remote_port: 40000,
            state,
            opened_at,
            bytes_sent: 0,
            bytes_received: 0,
            process_id: None,
            process_name: None,
        }
    }

    fn established(remote: &str, local_port: u16, opened_at: DateTime<Utc>) -> ConnectionRecord {
        connection(remote, Protocol::Tcp, local_port, ConnectionState::Established, opened_at)
    }

    fn half_open(remote: &str) -> ConnectionRecord {
        connection(remote, Protocol::Tcp, 443, ConnectionState::SynReceived, base())
    }

    fn engine() -> DdosDetectionEngine {
        DdosDetectionEngine::new(DdosDetectionConfig::default()).unwrap()
    }

    #[test]
    fn syn_only_packet_burst_raises_one_alert() {
        let packets: Vec<PacketRecord> = (0..150)
            .map(|i| {
                PacketRecord::tcp(
                    base() + Duration::milliseconds(i * 6),
                    (ip("203.0.113.9"), 50000),
                    (ip("10.0.0.1"), 1000 + i as u16),
                    60,
                    TcpFlags::SYN,
                )
            })
            .collect();
        let now = base() + Duration::milliseconds(900);
        let alerts = engine().analyze_packets(&packets, now);

        let syn: Vec<_> = alerts.iter().filter(|a| a.attack_type == AttackType::SynFlood).collect();
        assert_eq!(syn.len(), 1);
        assert_eq!(syn[0].source_ip, ip("203.0.113.9"));
        // 150 / 100 is below the 2x Medium step.
        assert_eq!(syn[0].severity, Severity::Low);
        assert_eq!(syn[0].packet_count, 150);
        assert!(!syn[0].is_resolved);
    }

    #[test]
    fn syn_ack_packets_are_not_counted() {
        let packets: Vec<PacketRecord> = (0..150)
            .map(|i| {
                PacketRecord::tcp(
                    base() + Duration::milliseconds(i),
                    (ip("203.0.113.9"), 50000),
                    (ip("10.0.0.1"), 80),
                    60,
                    TcpFlags::SYN | TcpFlags::ACK,
                )
            })
            .collect();
        let now = base() + Duration::milliseconds(500);
        assert!(engine().detect_packet_syn_flood(&packets, now).is_empty());
    }

    #[test]
    fn half_open_connections_per_source() {
        let mut connections: Vec<ConnectionRecord> =
            (0..350).map(|_| half_open("198.51.100.20")).collect();
        connections.push(half_open("198.51.100.21"));
        let alerts = engine().detect_syn_flood(&connections, base());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::High);
        assert_eq!(alerts[0].connection_count, 350);
    }

    #[test]
    fn udp_sessions_outside_window_are_ignored() {
        let now = base() + Duration::seconds(10);
        let mut connections: Vec<ConnectionRecord> = (0..600)
            .map(|_| {
                connection("198.51.100.30", Protocol::Udp, 53, ConnectionState::Unknown, base())
            })
            .collect();
        assert!(engine().detect_udp_flood(&connections, now).is_empty());

        connections.iter_mut().for_each(|c| c.opened_at = now - Duration::milliseconds(200));
        let alerts = engine().detect_udp_flood(&connections, now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].attack_type, AttackType::UdpFlood);
    }

    #[test]
    fn http_flood_counts_only_web_ports() {
        let now = base();
        let mut connections: Vec<ConnectionRecord> =
            (0..150).map(|_| established("198.51.100.40", 80, now)).collect();
        connections.extend((0..150).map(|_| established("198.51.100.41", 8080, now)));
        let alerts = engine().detect_http_flood(&connections, now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].source_ip, ip("198.51.100.40"));
    }

    #[test]
    fn slowloris_needs_ten_old_quiet_connections() {
        let now = base() + Duration::seconds(60);
        let mut connections: Vec<ConnectionRecord> =
            (0..9).map(|_| established("198.51.100.50", 80, base())).collect();
        assert!(engine().detect_slowloris(&connections, now).is_empty());

        connections.push(established("198.51.100.50", 80, base()));
        let alerts = engine().detect_slowloris(&connections, now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].attack_type, AttackType::Slowloris);

        // A connection that moved real data no longer counts.
        connections[0].bytes_received = 4096;
        assert!(engine().detect_slowloris(&connections, now).is_empty());
    }

    #[test]
    fn icmp_and_bandwidth_packet_detectors() {
        let now = base() + Duration::milliseconds(999);
        let packets: Vec<PacketRecord> = (0..120)
            .map(|i| {
                let ts = base() + Duration::milliseconds(i * 8);
                PacketRecord::icmp(ts, ip("198.51.100.60"), ip("10.0.0.1"), 100_000)
            })
            .collect();
        let alerts = engine().analyze_packets(&packets, now);
        assert!(alerts.iter().any(|a| a.attack_type == AttackType::IcmpFlood));
        let bandwidth = alerts
            .iter()
            .find(|a| a.attack_type == AttackType::BandwidthFlood)
            .expect("12 MB in one second exceeds 10 MB/s");
        assert_eq!(bandwidth.byte_count, 12_000_000);
        assert_eq!(bandwidth.severity, Severity::Low);
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        let config = DdosDetectionConfig {
            syn_flood_threshold: 0,
            ..Default::default()
        };
        assert!(matches!(
            DdosDetectionEngine::new(config.clone()),
            Err(DetectionError::InvalidThreshold { name: "syn_flood_threshold", .. })
        ));

        let engine = engine();
        assert!(engine.update_config(config).is_err());
        assert_eq!(engine.config().syn_flood_threshold, 100);
    }
}
