//! Packet and connection facts shared by every analysis stage.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport protocol of a captured packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// TCP flag bitset (FIN, SYN, RST, PSH, ACK, URG, ECE, CWR)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const NONE: TcpFlags = TcpFlags(0);
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);
    pub const ECE: TcpFlags = TcpFlags(0x40);
    pub const CWR: TcpFlags = TcpFlags(0x80);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: TcpFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// SYN without ACK, i.e. a connection opening request.
    pub fn is_syn_only(self) -> bool {
        self.contains(Self::SYN) && !self.contains(Self::ACK)
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 8] = [
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::URG, "URG"),
            (TcpFlags::ECE, "ECE"),
            (TcpFlags::CWR, "CWR"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&names.join("+"))
        }
    }
}

/// Canonical parsed packet. Missing ports or process info are simply absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    #[serde(default)]
    pub src_port: Option<u16>,
    #[serde(default)]
    pub dst_port: Option<u16>,
    pub length: u32,
    #[serde(default)]
    pub tcp_flags: TcpFlags,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub process_name: Option<String>,
}

impl PacketRecord {
    pub fn tcp(
        timestamp: DateTime<Utc>,
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
        length: u32,
        flags: TcpFlags,
    ) -> Self {
        Self {
            timestamp,
            protocol: Protocol::Tcp,
            src_ip: src.0,
            dst_ip: dst.0,
            src_port: Some(src.1),
            dst_port: Some(dst.1),
            length,
            tcp_flags: flags,
            process_id: None,
            process_name: None,
        }
    }

    pub fn udp(
        timestamp: DateTime<Utc>,
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
        length: u32,
    ) -> Self {
        Self {
            protocol: Protocol::Udp,
            tcp_flags: TcpFlags::NONE,
            ..Self::tcp(timestamp, src, dst, length, TcpFlags::NONE)
        }
    }

    pub fn icmp(timestamp: DateTime<Utc>, src_ip: IpAddr, dst_ip: IpAddr, length: u32) -> Self {
        Self {
            timestamp,
            protocol: Protocol::Icmp,
            src_ip,
            dst_ip,
            src_port: None,
            dst_port: None,
            length,
            tcp_flags: TcpFlags::NONE,
            process_id: None,
            process_name: None,
        }
    }

    pub fn with_process(mut self, process_id: u32, process_name: impl Into<String>) -> Self {
        self.process_id = Some(process_id);
        self.process_name = Some(process_name.into());
        self
    }
}

/// 5-tuple identifying one direction of traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: Protocol,
}

impl FlowKey {
    pub fn from_packet(packet: &PacketRecord) -> Self {
        Self {
            src_ip: packet.src_ip,
            src_port: packet.src_port.unwrap_or(0),
            dst_ip: packet.dst_ip,
            dst_port: packet.dst_port.unwrap_or(0),
            protocol: packet.protocol,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Directed TCP endpoint pair `src:port -> dst:port`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl ConnectionKey {
    pub fn from_packet(packet: &PacketRecord) -> Self {
        Self {
            src_ip: packet.src_ip,
            src_port: packet.src_port.unwrap_or(0),
            dst_ip: packet.dst_ip,
            dst_port: packet.dst_port.unwrap_or(0),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}:{}", self.src_ip, self.src_port, self.dst_ip, self.dst_port)
    }
}

/// Socket-table state of a connection summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait,
    CloseWait,
    TimeWait,
    Closed,
    Unknown,
}

impl ConnectionState {
    pub fn is_half_open(self) -> bool {
        matches!(self, ConnectionState::SynSent | ConnectionState::SynReceived)
    }
}

/// Per-connection summary, as supplied by a socket-table feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub protocol: Protocol,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub state: ConnectionState,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub process_name: Option<String>,
}

impl ConnectionRecord {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_set_operations() {
        let syn_ack = TcpFlags::SYN | TcpFlags::ACK;
        assert!(syn_ack.contains(TcpFlags::SYN));
        assert!(!syn_ack.is_syn_only());
        assert!(TcpFlags::SYN.is_syn_only());
        assert!(syn_ack.intersects(TcpFlags::ACK | TcpFlags::RST));
        assert_eq!(syn_ack.to_string(), "SYN+ACK");
        assert_eq!(TcpFlags::NONE.to_string(), "-");
    }

    #[test]
    fn keys_default_missing_ports_to_zero() {
        let packet = PacketRecord::icmp(
            Utc::now(),
            "203.0.113.1".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            84,
        );
        let key = FlowKey::from_packet(&packet);
        assert_eq!(key.src_port, 0);
        assert_eq!(key.dst_port, 0);
        assert_eq!(key.protocol, Protocol::Icmp);
    }

    #[test]
    fn packet_deserializes_with_absent_optional_fields() {
        let json = r#"{
            "timestamp": "2024-01-01T00:00:00Z",
            "protocol": "Udp",
            "src_ip": "198.51.100.4",
            "dst_ip": "10.0.0.1",
            "length": 80
        }"#;
        let packet: PacketRecord = serde_json::from_str(json).unwrap();
        assert_eq!(packet.src_port, None);
        assert!(packet.tcp_flags.is_empty());
    }
}
