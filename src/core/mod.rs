//! Core functionality of the defense engine.
//!
//! Packet facts and trackers, the detectors, the rate limiters, the block
//! rule engine, the collaborators they talk to, and the orchestrator that
//! threads packets through all of it.

pub mod alert;
pub mod analytics;
pub mod cloudflare;
pub mod ddos_detector;
pub mod enforcement;
pub mod events;
pub mod flow;
pub mod orchestrator;
pub mod packet;
pub mod packet_analyzer;
pub mod rate_limiter;
pub mod reputation;
pub mod rule_engine;
pub mod signatures;
pub mod size_distribution;
pub mod store;

pub use alert::{AdvancedDdosAlert, AttackType, DdosAlert, Severity};
pub use analytics::{DefenseStatistics, StatisticsSnapshot};
pub use ddos_detector::{DdosDetectionConfig, DdosDetectionEngine};
pub use enforcement::{BlockDuration, BlockTarget, Enforcer, LogOnlyEnforcer};
pub use events::{DefenseActionResult, DefenseEvent, EventBus};
pub use orchestrator::{DefenseContext, DefenseError, DefenseOrchestrator, OrchestratorConfig};
pub use packet::{ConnectionRecord, PacketRecord, Protocol, TcpFlags};
pub use packet_analyzer::{AdvancedPacketAnalyzer, AnalyzerConfig};
pub use rate_limiter::{ConnectionAttempt, RateLimitConfig, RateLimitViolation, RateLimitingService};
pub use rule_engine::{BlockDecision, BlockLevel, BlockRuleConfig, BlockRuleEngine, ConnectionFact};
pub use signatures::{Signature, SignatureConfig, SignatureEngine};
pub use store::{BlockEventRecord, BlockEventStore, MemoryBlockStore, RedisBlockStore};
