//! Sub-pattern matchers. Each variant inspects a packet batch, usually
//! restricted to a trailing window, and attributes the match to one source.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::SignatureError;
use crate::core::packet::{FlowKey, PacketRecord, Protocol, TcpFlags};
use crate::utils::{below_score, exceed_score, mean_and_std_dev, within_window};

/// Outcome of a single sub-pattern over a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern: String,
    pub is_match: bool,
    /// Score in `[0, 100]`
    pub score: f64,
    pub source_ip: Option<IpAddr>,
    pub details: String,
}

impl PatternMatch {
    fn hit(pattern: &str, score: f64, source_ip: IpAddr, details: String) -> Self {
        Self {
            pattern: pattern.to_string(),
            is_match: true,
            score,
            source_ip: Some(source_ip),
            details,
        }
    }

    fn miss(pattern: &str, details: impl Into<String>) -> Self {
        Self {
            pattern: pattern.to_string(),
            is_match: false,
            score: 0.0,
            source_ip: None,
            details: details.into(),
        }
    }
}

/// One matcher in a signature's conjunction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubPattern {
    /// TCP packets carrying all `required` flags and none of `forbidden`
    TcpFlags {
        required: TcpFlags,
        #[serde(default)]
        forbidden: TcpFlags,
        min_count: usize,
        window_secs: i64,
    },
    /// Packets per second from one source, optionally for a single protocol
    PacketRate {
        #[serde(default)]
        protocol: Option<Protocol>,
        min_packets_per_second: f64,
        window_secs: i64,
    },
    /// UDP response bytes against request bytes, grouped by service port
    Amplification {
        ports: Vec<u16>,
        min_ratio: f64,
        /// Packets up to this size count as requests, larger ones as responses
        max_request_size: u32,
        window_secs: i64,
    },
    /// Packets whose size falls in `[min_size, max_size]`
    PacketSize {
        min_size: u32,
        max_size: u32,
        min_count: usize,
        window_secs: i64,
    },
    /// Many long-lived TCP flows moving almost no data
    SlowConnection {
        max_bytes_per_flow: u64,
        min_duration_secs: i64,
        min_concurrent_flows: usize,
    },
    /// Many small TCP packets to web ports
    HttpHeader {
        ports: Vec<u16>,
        max_packet_size: u32,
        min_count: usize,
        window_secs: i64,
    },
    /// Share of packets below `fragment_max_size`
    Fragmentation {
        fragment_max_size: u32,
        min_ratio: f64,
        min_packets: usize,
        window_secs: i64,
    },
    /// Inter-arrival time standard deviation below a limit
    TimingRegularity {
        max_std_dev_ms: f64,
        min_samples: usize,
        window_secs: i64,
    },
    /// Packet size standard deviation below a limit
    SizeUniformity {
        max_std_dev: f64,
        min_samples: usize,
        window_secs: i64,
    },
}

fn windowed<'a>(
    packets: &'a [PacketRecord],
    now: DateTime<Utc>,
    window_secs: i64,
) -> impl Iterator<Item = &'a PacketRecord> + 'a {
    let window = Duration::seconds(window_secs);
    packets
        .iter()
        .filter(move |p| within_window(p.timestamp, now, window))
}

/// Highest value wins, ties broken by address so results are stable.
fn top_source<V: PartialOrd + Copy>(values: &HashMap<IpAddr, V>) -> Option<(IpAddr, V)> {
    values
        .iter()
        .max_by(|a, b| {
            a.1.partial_cmp(b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.cmp(a.0))
        })
        .map(|(ip, v)| (*ip, *v))
}

fn count_by_source<'a, I>(packets: I) -> HashMap<IpAddr, usize>
where
    I: Iterator<Item = &'a PacketRecord>,
{
    let mut counts = HashMap::new();
    for packet in packets {
        *counts.entry(packet.src_ip).or_insert(0) += 1;
    }
    counts
}

fn group_by_source<'a, I>(packets: I) -> HashMap<IpAddr, Vec<&'a PacketRecord>>
where
    I: Iterator<Item = &'a PacketRecord>,
{
    let mut groups: HashMap<IpAddr, Vec<&PacketRecord>> = HashMap::new();
    for packet in packets {
        groups.entry(packet.src_ip).or_default().push(packet);
    }
    groups
}

impl SubPattern {
    pub fn name(&self) -> &'static str {
        match self {
            SubPattern::TcpFlags { .. } => "tcp_flags",
            SubPattern::PacketRate { .. } => "packet_rate",
            SubPattern::Amplification { .. } => "amplification",
            SubPattern::PacketSize { .. } => "packet_size",
            SubPattern::SlowConnection { .. } => "slow_connection",
            SubPattern::HttpHeader { .. } => "http_header",
            SubPattern::Fragmentation { .. } => "fragmentation",
            SubPattern::TimingRegularity { .. } => "timing_regularity",
            SubPattern::SizeUniformity { .. } => "size_uniformity",
        }
    }

    /// Rejects parameters that would make the matcher meaningless.
    pub fn validate(&self) -> Result<(), SignatureError> {
        let invalid = |reason: &str| {
            Err(SignatureError::InvalidPattern {
                pattern: self.name().to_string(),
                reason: reason.to_string(),
            })
        };

        let window = match self {
            SubPattern::SlowConnection { .. } => None,
            SubPattern::TcpFlags { window_secs, .. }
            | SubPattern::PacketRate { window_secs, .. }
            | SubPattern::Amplification { window_secs, .. }
            | SubPattern::PacketSize { window_secs, .. }
            | SubPattern::HttpHeader { window_secs, .. }
            | SubPattern::Fragmentation { window_secs, .. }
            | SubPattern::TimingRegularity { window_secs, .. }
            | SubPattern::SizeUniformity { window_secs, .. } => Some(*window_secs),
        };
        if matches!(window, Some(w) if w <= 0) {
            return invalid("window_secs must be positive");
        }

        match self {
            SubPattern::TcpFlags { required, min_count, .. } => {
                if required.is_empty() {
                    return invalid("required flags must not be empty");
                }
                if *min_count == 0 {
                    return invalid("min_count must be positive");
                }
            }
            SubPattern::PacketRate { min_packets_per_second, .. } => {
                if !(*min_packets_per_second > 0.0) {
                    return invalid("min_packets_per_second must be positive");
                }
            }
            SubPattern::Amplification { ports, min_ratio, .. } => {
                if ports.is_empty() {
                    return invalid("ports must not be empty");
                }
                if !(*min_ratio > 0.0) {
                    return invalid("min_ratio must be positive");
                }
            }
            SubPattern::PacketSize { min_size, max_size, min_count, .. } => {
                if min_size > max_size {
                    return invalid("min_size exceeds max_size");
                }
                if *min_count == 0 {
                    return invalid("min_count must be positive");
                }
            }
            SubPattern::SlowConnection { min_duration_secs, min_concurrent_flows, .. } => {
                if *min_duration_secs <= 0 || *min_concurrent_flows == 0 {
                    return invalid("min_duration_secs and min_concurrent_flows must be positive");
                }
            }
            SubPattern::HttpHeader { ports, min_count, .. } => {
                if ports.is_empty() || *min_count == 0 {
                    return invalid("ports and min_count must be set");
                }
            }
            SubPattern::Fragmentation { min_ratio, min_packets, .. } => {
                if !(0.0..=1.0).contains(min_ratio) || *min_packets == 0 {
                    return invalid("min_ratio must be in [0, 1] and min_packets positive");
                }
            }
            SubPattern::TimingRegularity { max_std_dev_ms, min_samples, .. } => {
                if !(*max_std_dev_ms > 0.0) || *min_samples < 2 {
                    return invalid("max_std_dev_ms must be positive and min_samples at least 2");
                }
            }
            SubPattern::SizeUniformity { max_std_dev, min_samples, .. } => {
                if !(*max_std_dev > 0.0) || *min_samples < 2 {
                    return invalid("max_std_dev must be positive and min_samples at least 2");
                }
            }
        }
        Ok(())
    }

    pub fn evaluate(
        &self,
        packets: &[PacketRecord],
        now: DateTime<Utc>,
    ) -> Result<PatternMatch, SignatureError> {
        self.validate()?;
        let name = self.name();

        let result = match self {
            SubPattern::TcpFlags { required, forbidden, min_count, window_secs } => {
                let counts = count_by_source(windowed(packets, now, *window_secs).filter(|p| {
                    p.protocol == Protocol::Tcp
                        && p.tcp_flags.contains(*required)
                        && !p.tcp_flags.intersects(*forbidden)
                }));
                match top_source(&counts) {
                    Some((ip, count)) if count >= *min_count => PatternMatch::hit(
                        name,
                        exceed_score(count as f64, *min_count as f64),
                        ip,
                        format!("{} packets with {} (minimum {})", count, required, min_count),
                    ),
                    _ => PatternMatch::miss(
                        name,
                        format!("fewer than {} packets with {}", min_count, required),
                    ),
                }
            }

            SubPattern::PacketRate { protocol, min_packets_per_second, window_secs } => {
                let counts = count_by_source(
                    windowed(packets, now, *window_secs)
                        .filter(|p| protocol.map_or(true, |proto| p.protocol == proto)),
                );
                let rate = top_source(&counts)
                    .map(|(ip, count)| (ip, count as f64 / *window_secs as f64));
                match rate {
                    Some((ip, pps)) if pps >= *min_packets_per_second => PatternMatch::hit(
                        name,
                        exceed_score(pps, *min_packets_per_second),
                        ip,
                        format!("{:.1} packets/s (minimum {:.1})", pps, min_packets_per_second),
                    ),
                    _ => PatternMatch::miss(
                        name,
                        format!("rate below {:.1} packets/s", min_packets_per_second),
                    ),
                }
            }

            SubPattern::Amplification { ports, min_ratio, max_request_size, window_secs } => {
                #[derive(Default)]
                struct PortTraffic {
                    request_bytes: u64,
                    response_bytes: u64,
                    responders: HashMap<IpAddr, u64>,
                }

                let mut by_port: HashMap<u16, PortTraffic> = HashMap::new();
                let udp = windowed(packets, now, *window_secs)
                    .filter(|p| p.protocol == Protocol::Udp);
                for packet in udp {
                    let service_port = packet
                        .dst_port
                        .filter(|port| ports.contains(port))
                        .or_else(|| packet.src_port.filter(|port| ports.contains(port)));
                    let Some(port) = service_port else { continue };

                    let traffic = by_port.entry(port).or_default();
                    let length = u64::from(packet.length);
                    if packet.length <= *max_request_size {
                        traffic.request_bytes += length;
                    } else {
                        traffic.response_bytes += length;
                        *traffic.responders.entry(packet.src_ip).or_insert(0) += length;
                    }
                }

                let best = by_port
                    .iter()
                    .filter(|(_, t)| t.request_bytes > 0 && t.response_bytes > 0)
                    .map(|(port, t)| (*port, t, t.response_bytes as f64 / t.request_bytes as f64))
                    .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

                match best {
                    Some((port, traffic, ratio)) if ratio >= *min_ratio => {
                        match top_source(&traffic.responders) {
                            Some((ip, _)) => PatternMatch::hit(
                                name,
                                exceed_score(ratio, *min_ratio),
                                ip,
                                format!(
                                    "port {}: {} response bytes vs {} request bytes \
                                     (ratio {:.2}, minimum {:.2})",
                                    port,
                                    traffic.response_bytes,
                                    traffic.request_bytes,
                                    ratio,
                                    min_ratio
                                ),
                            ),
                            None => PatternMatch::miss(name, "no responder identified"),
                        }
                    }
                    Some((port, _, ratio)) => PatternMatch::miss(
                        name,
                        format!("port {} ratio {:.2} below {:.2}", port, ratio, min_ratio),
                    ),
                    None => PatternMatch::miss(name, "no request/response pairs on watched ports"),
                }
            }

            SubPattern::PacketSize { min_size, max_size, min_count, window_secs } => {
                let counts = count_by_source(
                    windowed(packets, now, *window_secs)
                        .filter(|p| p.length >= *min_size && p.length <= *max_size),
                );
                match top_source(&counts) {
                    Some((ip, count)) if count >= *min_count => PatternMatch::hit(
                        name,
                        exceed_score(count as f64, *min_count as f64),
                        ip,
                        format!("{} packets sized {}-{} bytes", count, min_size, max_size),
                    ),
                    _ => PatternMatch::miss(
                        name,
                        format!("fewer than {} packets sized {}-{}", min_count, min_size, max_size),
                    ),
                }
            }

            SubPattern::SlowConnection {
                max_bytes_per_flow,
                min_duration_secs,
                min_concurrent_flows,
            } => {
                struct FlowSpan {
                    first: DateTime<Utc>,
                    last: DateTime<Utc>,
                    bytes: u64,
                }

                let mut flows: HashMap<FlowKey, FlowSpan> = HashMap::new();
                let tcp = packets
                    .iter()
                    .filter(|p| p.protocol == Protocol::Tcp && p.timestamp <= now);
                for packet in tcp {
                    let span = flows.entry(FlowKey::from_packet(packet)).or_insert(FlowSpan {
                        first: packet.timestamp,
                        last: packet.timestamp,
                        bytes: 0,
                    });
                    span.first = span.first.min(packet.timestamp);
                    span.last = span.last.max(packet.timestamp);
                    span.bytes += u64::from(packet.length);
                }

                let min_duration = Duration::seconds(*min_duration_secs);
                let mut slow: HashMap<IpAddr, usize> = HashMap::new();
                for (key, span) in &flows {
                    if span.last - span.first >= min_duration && span.bytes <= *max_bytes_per_flow {
                        *slow.entry(key.src_ip).or_insert(0) += 1;
                    }
                }

                match top_source(&slow) {
                    Some((ip, count)) if count >= *min_concurrent_flows => PatternMatch::hit(
                        name,
                        exceed_score(count as f64, *min_concurrent_flows as f64),
                        ip,
                        format!(
                            "{} flows open at least {}s with at most {} bytes each",
                            count, min_duration_secs, max_bytes_per_flow
                        ),
                    ),
                    _ => PatternMatch::miss(
                        name,
                        format!("fewer than {} slow flows", min_concurrent_flows),
                    ),
                }
            }

            SubPattern::HttpHeader { ports, max_packet_size, min_count, window_secs } => {
                let counts = count_by_source(windowed(packets, now, *window_secs).filter(|p| {
                    p.protocol == Protocol::Tcp
                        && p.length <= *max_packet_size
                        && p.dst_port.map_or(false, |port| ports.contains(&port))
                }));
                match top_source(&counts) {
                    Some((ip, count)) if count >= *min_count => PatternMatch::hit(
                        name,
                        exceed_score(count as f64, *min_count as f64),
                        ip,
                        format!("{} small packets to web ports", count),
                    ),
                    _ => PatternMatch::miss(
                        name,
                        format!("fewer than {} small packets to web ports", min_count),
                    ),
                }
            }

            SubPattern::Fragmentation {
                fragment_max_size,
                min_ratio,
                min_packets,
                window_secs,
            } => {
                let mut ratios: HashMap<IpAddr, f64> = HashMap::new();
                for (ip, group) in group_by_source(windowed(packets, now, *window_secs)) {
                    if group.len() < *min_packets {
                        continue;
                    }
                    let small = group.iter().filter(|p| p.length < *fragment_max_size).count();
                    ratios.insert(ip, small as f64 / group.len() as f64);
                }
                match top_source(&ratios) {
                    Some((ip, ratio)) if ratio >= *min_ratio => PatternMatch::hit(
                        name,
                        exceed_score(ratio, *min_ratio),
                        ip,
                        format!(
                            "{:.0}% of packets under {} bytes",
                            ratio * 100.0,
                            fragment_max_size
                        ),
                    ),
                    _ => PatternMatch::miss(name, format!("fragment ratio below {:.2}", min_ratio)),
                }
            }

            SubPattern::TimingRegularity { max_std_dev_ms, min_samples, window_secs } => {
                let mut deviations: HashMap<IpAddr, f64> = HashMap::new();
                for (ip, group) in group_by_source(windowed(packets, now, *window_secs)) {
                    let mut times: Vec<DateTime<Utc>> = group.iter().map(|p| p.timestamp).collect();
                    times.sort();
                    let gaps: Vec<f64> = times
                        .windows(2)
                        .map(|pair| {
                            let micros = (pair[1] - pair[0]).num_microseconds().unwrap_or(i64::MAX);
                            micros as f64 / 1000.0
                        })
                        .collect();
                    if gaps.len() < *min_samples {
                        continue;
                    }
                    let (_, std_dev) = mean_and_std_dev(gaps);
                    // Negated so the most regular source ranks highest.
                    deviations.insert(ip, -std_dev);
                }
                match top_source(&deviations) {
                    Some((ip, neg_std_dev)) if -neg_std_dev < *max_std_dev_ms => PatternMatch::hit(
                        name,
                        below_score(-neg_std_dev, *max_std_dev_ms),
                        ip,
                        format!(
                            "inter-arrival std dev {:.2}ms (limit {:.2}ms)",
                            -neg_std_dev, max_std_dev_ms
                        ),
                    ),
                    _ => PatternMatch::miss(name, "no source with regular timing"),
                }
            }

            SubPattern::SizeUniformity { max_std_dev, min_samples, window_secs } => {
                let mut deviations: HashMap<IpAddr, f64> = HashMap::new();
                for (ip, group) in group_by_source(windowed(packets, now, *window_secs)) {
                    if group.len() < *min_samples {
                        continue;
                    }
                    let (_, std_dev) = mean_and_std_dev(group.iter().map(|p| f64::from(p.length)));
                    deviations.insert(ip, -std_dev);
                }
                match top_source(&deviations) {
                    Some((ip, neg_std_dev)) if -neg_std_dev < *max_std_dev => PatternMatch::hit(
                        name,
                        below_score(-neg_std_dev, *max_std_dev),
                        ip,
                        format!(
                            "size std dev {:.2} bytes (limit {:.2})",
                            -neg_std_dev, max_std_dev
                        ),
                    ),
                    _ => PatternMatch::miss(name, "no source with uniform sizes"),
                }
            }
        };

        Ok(result)
    }
}
