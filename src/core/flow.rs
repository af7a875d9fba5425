//! Per-flow trackers: packet windows, the TCP flag state machine and UDP sessions.
//!
//! Every tracker keeps a bounded, time-ordered window of recent packets.
//! Records older than [`FLOW_RETENTION_SECS`] are evicted from the front on each
//! insert, so memory stays proportional to the traffic of the last few minutes.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::packet::{ConnectionKey, FlowKey, PacketRecord, TcpFlags};
use crate::utils::within_window;

/// How long packets stay in a tracker window, in seconds
pub const FLOW_RETENTION_SECS: i64 = 300;

/// Packets below this size count toward the fragmentation ratio
pub const FRAGMENT_SIZE_THRESHOLD: u32 = 500;

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    timestamp: DateTime<Utc>,
    length: u32,
}

fn evict_expired(window: &mut VecDeque<WindowEntry>, latest: DateTime<Utc>) {
    let Some(cutoff) = latest.checked_sub_signed(Duration::seconds(FLOW_RETENTION_SECS)) else {
        return;
    };
    while let Some(front) = window.front() {
        if front.timestamp < cutoff {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn count_last_second(window: &VecDeque<WindowEntry>, now: DateTime<Utc>) -> usize {
    window
        .iter()
        .rev()
        .filter(|entry| within_window(entry.timestamp, now, Duration::seconds(1)))
        .count()
}

/// Time-bounded packet window for one 5-tuple
#[derive(Debug)]
pub struct FlowTracker {
    key: FlowKey,
    window: VecDeque<WindowEntry>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    total_packets: u64,
    total_bytes: u64,
}

impl FlowTracker {
    pub fn new(key: FlowKey, first_seen: DateTime<Utc>) -> Self {
        Self {
            key,
            window: VecDeque::new(),
            first_seen,
            last_seen: first_seen,
            total_packets: 0,
            total_bytes: 0,
        }
    }

    pub fn add_packet(&mut self, packet: &PacketRecord) {
        self.window.push_back(WindowEntry {
            timestamp: packet.timestamp,
            length: packet.length,
        });
        self.total_packets += 1;
        self.total_bytes += u64::from(packet.length);
        if packet.timestamp > self.last_seen {
            self.last_seen = packet.timestamp;
        }
        evict_expired(&mut self.window, self.last_seen);
    }

    /// Packets observed in `(now - 1s, now]`
    pub fn packets_per_second(&self, now: DateTime<Utc>) -> f64 {
        count_last_second(&self.window, now) as f64
    }

    /// Fraction of windowed packets smaller than [`FRAGMENT_SIZE_THRESHOLD`]
    pub fn fragmentation_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let small = self
            .window
            .iter()
            .filter(|entry| entry.length < FRAGMENT_SIZE_THRESHOLD)
            .count();
        small as f64 / self.window.len() as f64
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// Flag-driven TCP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TcpConnectionState {
    Unknown,
    SynSent,
    SynReceived,
    Established,
    FinWait,
    Closed,
}

impl TcpConnectionState {
    /// Pure transition function. RST forces `Closed` from any state.
    pub fn next(self, flags: TcpFlags) -> Self {
        use TcpConnectionState::*;

        if flags.contains(TcpFlags::RST) {
            return Closed;
        }
        let syn = flags.contains(TcpFlags::SYN);
        let ack = flags.contains(TcpFlags::ACK);
        let fin = flags.contains(TcpFlags::FIN);

        match self {
            Unknown | Closed if syn && !ack => SynSent,
            Unknown if syn && ack => SynReceived,
            // Picked up mid-stream.
            Unknown if ack => Established,
            SynSent if syn && ack => SynReceived,
            SynReceived if ack && !syn => Established,
            Established if fin => FinWait,
            FinWait if ack || fin => Closed,
            state => state,
        }
    }
}

/// A single anomaly raised by [`TcpConnectionAnalyzer::analyze_flags`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlagAnomaly {
    /// Mutually exclusive flags set together (SYN+FIN, SYN+RST, FIN+RST)
    InvalidFlagCombination { flags: TcpFlags },
    /// More than [`UNMATCHED_SYN_LIMIT`] SYNs without a matching ACK
    UnmatchedSyn { count: u64 },
    /// More than [`RST_LIMIT`] resets on one connection
    RstFlood { count: u64 },
    /// More than [`RECENT_PACKET_LIMIT`] packets in the last minute
    ExcessivePacketRate { packets_last_minute: usize },
    /// SYN share of recent packets above [`SYN_RATIO_LIMIT`]
    HighSynRatio { ratio: f64 },
}

impl std::fmt::Display for FlagAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlagAnomaly::InvalidFlagCombination { flags } => {
                write!(f, "invalid flag combination {}", flags)
            }
            FlagAnomaly::UnmatchedSyn { count } => write!(f, "{} unmatched SYN packets", count),
            FlagAnomaly::RstFlood { count } => write!(f, "{} RST packets", count),
            FlagAnomaly::ExcessivePacketRate { packets_last_minute } => {
                write!(f, "{} packets in the last minute", packets_last_minute)
            }
            FlagAnomaly::HighSynRatio { ratio } => write!(f, "SYN ratio {:.0}%", ratio * 100.0),
        }
    }
}

pub const UNMATCHED_SYN_LIMIT: u64 = 10;
pub const RST_LIMIT: u64 = 5;
pub const RECENT_PACKET_LIMIT: usize = 100;
pub const SYN_RATIO_LIMIT: f64 = 0.8;
/// Minimum recent packets before the SYN ratio is judged
pub const SYN_RATIO_MIN_PACKETS: usize = 10;

/// Result of feeding one packet through the connection analyzer
#[derive(Debug, Clone, PartialEq)]
pub struct FlagAnalysis {
    pub state: TcpConnectionState,
    pub anomalies: Vec<FlagAnomaly>,
}

impl FlagAnalysis {
    pub fn is_anomalous(&self) -> bool {
        !self.anomalies.is_empty()
    }
}

/// Flag counters and state machine for one TCP connection key
#[derive(Debug)]
pub struct TcpConnectionAnalyzer {
    key: ConnectionKey,
    state: TcpConnectionState,
    syn_count: u64,
    syn_ack_count: u64,
    ack_count: u64,
    fin_count: u64,
    rst_count: u64,
    recent: VecDeque<(DateTime<Utc>, TcpFlags)>,
    is_anomalous: bool,
    last_seen: DateTime<Utc>,
}

impl TcpConnectionAnalyzer {
    pub fn new(key: ConnectionKey, first_seen: DateTime<Utc>) -> Self {
        Self {
            key,
            state: TcpConnectionState::Unknown,
            syn_count: 0,
            syn_ack_count: 0,
            ack_count: 0,
            fin_count: 0,
            rst_count: 0,
            recent: VecDeque::new(),
            is_anomalous: false,
            last_seen: first_seen,
        }
    }

    pub fn analyze_flags(&mut self, packet: &PacketRecord) -> FlagAnalysis {
        let flags = packet.tcp_flags;

        if flags.is_syn_only() {
            self.syn_count += 1;
        }
        if flags.contains(TcpFlags::SYN | TcpFlags::ACK) {
            self.syn_ack_count += 1;
        }
        if flags.contains(TcpFlags::ACK) {
            self.ack_count += 1;
        }
        if flags.contains(TcpFlags::FIN) {
            self.fin_count += 1;
        }
        if flags.contains(TcpFlags::RST) {
            self.rst_count += 1;
        }

        if packet.timestamp > self.last_seen {
            self.last_seen = packet.timestamp;
        }
        self.recent.push_back((packet.timestamp, flags));
        if let Some(cutoff) = self.last_seen.checked_sub_signed(Duration::minutes(1)) {
            while let Some((ts, _)) = self.recent.front() {
                if *ts < cutoff {
                    self.recent.pop_front();
                } else {
                    break;
                }
            }
        }

        self.state = self.state.next(flags);

        let mut anomalies = Vec::new();

        let syn_fin = flags.contains(TcpFlags::SYN | TcpFlags::FIN);
        let syn_rst = flags.contains(TcpFlags::SYN | TcpFlags::RST);
        let fin_rst = flags.contains(TcpFlags::FIN | TcpFlags::RST);
        if syn_fin || syn_rst || fin_rst {
            anomalies.push(FlagAnomaly::InvalidFlagCombination { flags });
        }

        let unmatched = self.unmatched_syns();
        if unmatched > UNMATCHED_SYN_LIMIT {
            anomalies.push(FlagAnomaly::UnmatchedSyn { count: unmatched });
        }

        if self.rst_count > RST_LIMIT {
            anomalies.push(FlagAnomaly::RstFlood { count: self.rst_count });
        }

        let recent_len = self.recent.len();
        if recent_len > RECENT_PACKET_LIMIT {
            anomalies.push(FlagAnomaly::ExcessivePacketRate {
                packets_last_minute: recent_len,
            });
        }
        if recent_len >= SYN_RATIO_MIN_PACKETS {
            let syns = self.recent.iter().filter(|(_, f)| f.is_syn_only()).count();
            let ratio = syns as f64 / recent_len as f64;
            if ratio > SYN_RATIO_LIMIT {
                anomalies.push(FlagAnomaly::HighSynRatio { ratio });
            }
        }

        if !anomalies.is_empty() {
            self.is_anomalous = true;
        }

        FlagAnalysis {
            state: self.state,
            anomalies,
        }
    }

    /// Opening SYNs not answered by an ACK-bearing packet
    pub fn unmatched_syns(&self) -> u64 {
        self.syn_count.saturating_sub(self.ack_count)
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn state(&self) -> TcpConnectionState {
        self.state
    }

    pub fn is_anomalous(&self) -> bool {
        self.is_anomalous
    }

    pub fn syn_count(&self) -> u64 {
        self.syn_count
    }

    pub fn syn_ack_count(&self) -> u64 {
        self.syn_ack_count
    }

    pub fn ack_count(&self) -> u64 {
        self.ack_count
    }

    pub fn fin_count(&self) -> u64 {
        self.fin_count
    }

    pub fn rst_count(&self) -> u64 {
        self.rst_count
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }
}

/// Packet and byte counters for one UDP session
#[derive(Debug)]
pub struct UdpSessionAnalyzer {
    key: FlowKey,
    window: VecDeque<WindowEntry>,
    packet_count: u64,
    byte_count: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl UdpSessionAnalyzer {
    pub fn new(key: FlowKey, first_seen: DateTime<Utc>) -> Self {
        Self {
            key,
            window: VecDeque::new(),
            packet_count: 0,
            byte_count: 0,
            first_seen,
            last_seen: first_seen,
        }
    }

    pub fn add_packet(&mut self, packet: &PacketRecord) {
        self.packet_count += 1;
        self.byte_count += u64::from(packet.length);
        if packet.timestamp > self.last_seen {
            self.last_seen = packet.timestamp;
        }
        self.window.push_back(WindowEntry {
            timestamp: packet.timestamp,
            length: packet.length,
        });
        evict_expired(&mut self.window, self.last_seen);
    }

    pub fn packets_per_second(&self, now: DateTime<Utc>) -> f64 {
        count_last_second(&self.window, now) as f64
    }

    pub fn bytes_per_second(&self, now: DateTime<Utc>) -> u64 {
        self.window
            .iter()
            .filter(|entry| within_window(entry.timestamp, now, Duration::seconds(1)))
            .map(|entry| u64::from(entry.length))
            .sum()
    }

    pub fn average_packet_size(&self) -> f64 {
        if self.packet_count == 0 {
            0.0
        } else {
            self.byte_count as f64 / self.packet_count as f64
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    pub fn duration(&self) -> Duration {
        self.last_seen - self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }
}
