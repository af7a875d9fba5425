//! Built-in signatures registered when `include_defaults` is set.

use super::patterns::SubPattern;
use super::Signature;
use crate::core::alert::{AttackType, Severity};
use crate::core::packet::{Protocol, TcpFlags};

/// UDP services commonly abused as reflectors
pub const AMPLIFICATION_PORTS: [u16; 9] = [17, 19, 53, 123, 161, 389, 1900, 11211, 27015];

pub const WEB_PORTS: [u16; 2] = [80, 443];

pub fn default_signatures() -> Vec<Signature> {
    vec![
        Signature::new("SIG-SYN-FLOOD", "SYN flood", AttackType::SynFlood, Severity::High)
            .with_description("Burst of opening SYNs that never complete the handshake")
            .with_pattern(SubPattern::TcpFlags {
                required: TcpFlags::SYN,
                forbidden: TcpFlags::ACK,
                min_count: 100,
                window_secs: 10,
            })
            .with_pattern(SubPattern::PacketRate {
                protocol: Some(Protocol::Tcp),
                min_packets_per_second: 10.0,
                window_secs: 10,
            }),
        Signature::new(
            "SIG-UDP-AMP",
            "UDP amplification",
            AttackType::UdpAmplification,
            Severity::Critical,
        )
        .with_description("Small requests to reflector services answered by much larger responses")
        .with_pattern(SubPattern::Amplification {
            ports: AMPLIFICATION_PORTS.to_vec(),
            min_ratio: 10.0,
            max_request_size: 512,
            window_secs: 10,
        }),
        Signature::new("SIG-SLOWLORIS", "Slowloris", AttackType::Slowloris, Severity::High)
            .with_description("Many web connections held open while trickling header bytes")
            .with_pattern(SubPattern::SlowConnection {
                max_bytes_per_flow: 1024,
                min_duration_secs: 30,
                min_concurrent_flows: 10,
            })
            .with_pattern(SubPattern::HttpHeader {
                ports: WEB_PORTS.to_vec(),
                max_packet_size: 200,
                min_count: 10,
                window_secs: 60,
            }),
        Signature::new("SIG-ICMP-FLOOD", "ICMP flood", AttackType::IcmpFlood, Severity::High)
            .with_description("Sustained ICMP echo traffic from one source")
            .with_pattern(SubPattern::PacketRate {
                protocol: Some(Protocol::Icmp),
                min_packets_per_second: 50.0,
                window_secs: 10,
            }),
        Signature::new("SIG-RST-FLOOD", "TCP RST flood", AttackType::RstFlood, Severity::Medium)
            .with_description("Flood of reset segments tearing down connections")
            .with_pattern(SubPattern::TcpFlags {
                required: TcpFlags::RST,
                forbidden: TcpFlags::NONE,
                min_count: 50,
                window_secs: 10,
            }),
        Signature::new(
            "SIG-IP-FRAG",
            "IP fragmentation",
            AttackType::Fragmentation,
            Severity::Medium,
        )
        .with_description("High volume of fragment-sized packets")
        .with_pattern(SubPattern::Fragmentation {
            fragment_max_size: 500,
            min_ratio: 0.8,
            min_packets: 100,
            window_secs: 10,
        })
        .with_pattern(SubPattern::PacketRate {
            protocol: None,
            min_packets_per_second: 20.0,
            window_secs: 10,
        }),
        Signature::new("SIG-BOTNET", "Botnet pattern", AttackType::Botnet, Severity::High)
            .with_description("Machine-regular timing with near-identical packet sizes")
            .with_pattern(SubPattern::TimingRegularity {
                max_std_dev_ms: 5.0,
                min_samples: 20,
                window_secs: 10,
            })
            .with_pattern(SubPattern::SizeUniformity {
                max_std_dev: 10.0,
                min_samples: 20,
                window_secs: 10,
            }),
    ]
}
