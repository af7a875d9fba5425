//! Defense orchestrator.
//!
//! Owns the packet queue and the fixed-interval analysis cycle. Each cycle
//! drains the queue and the latest connection snapshot, updates per-key
//! traffic counters, runs the detectors and the rate limiters, and hands
//! flagged sources to the block rule engine.
//! Enforcement and persistence run as detached tasks so a slow collaborator
//! never stalls the cycle.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use crossbeam::queue::SegQueue;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::core::alert::{AttackType, DdosAlert, Severity};
use crate::core::analytics::DefenseStatistics;
use crate::core::ddos_detector::{DdosDetectionEngine, DetectionError};
use crate::core::enforcement::{BlockDuration, BlockTarget, Enforcer};
use crate::core::events::{DefenseAction, DefenseActionResult, DefenseEvent, EventBus};
use crate::core::packet::{ConnectionRecord, FlowKey, PacketRecord, Protocol};
use crate::core::packet_analyzer::AdvancedPacketAnalyzer;
use crate::core::rate_limiter::{
    ConnectionAttempt, LimitScope, RateLimitError, RateLimitViolation, RateLimitingService,
};
use crate::core::reputation::ReputationLookup;
use crate::core::rule_engine::{BlockDecision, BlockLevel, BlockRuleEngine, ConnectionFact};
use crate::core::signatures::{SignatureEngine, SignatureError};
use crate::core::store::{BlockEventRecord, BlockEventStore};
use crate::models::Config;
use crate::utils::{is_internal_address, within_window};

/// Errors that can occur while building or driving the orchestrator
#[derive(Error, Debug)]
pub enum DefenseError {
    #[error("Defense system is already running")]
    AlreadyRunning,
    #[error("Defense system is not running")]
    NotRunning,
    #[error("Detection configuration error: {0}")]
    Detection(#[from] DetectionError),
    #[error("Rate limit configuration error: {0}")]
    RateLimit(#[from] RateLimitError),
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub tick_interval_ms: u64,
    /// Packets per second on one traffic key before it is flagged
    pub packets_per_second_threshold: f64,
    /// Minimum gap between two alerts, or two mitigations, for the same key
    pub alert_cooldown_secs: i64,
    pub sweep_interval_secs: u64,
    /// Traffic counters idle for longer than this are dropped by the sweep
    pub traffic_idle_secs: i64,
    /// Process queued packets on stop instead of discarding them
    pub drain_on_stop: bool,
    /// Detector alerts at or above this severity flag their source for mitigation
    pub auto_mitigate_min_severity: Severity,
    /// Block length for rule-engine `Immediate` decisions
    pub block_duration_secs: u64,
    /// Packets stamped further than this from the wall clock are refused at
    /// intake. `None` accepts any timestamp (replayed captures).
    pub max_timestamp_skew_secs: Option<i64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            packets_per_second_threshold: 50.0,
            alert_cooldown_secs: 10,
            sweep_interval_secs: 60,
            traffic_idle_secs: 600,
            drain_on_stop: true,
            auto_mitigate_min_severity: Severity::High,
            block_duration_secs: 3600,
            max_timestamp_skew_secs: Some(300),
        }
    }
}

/// Every component and collaborator the defense pipeline needs, built once by
/// the driver and shared by handle.
pub struct DefenseContext {
    pub detector: DdosDetectionEngine,
    pub analyzer: AdvancedPacketAnalyzer,
    pub rate_limiter: Arc<RateLimitingService>,
    pub rule_engine: BlockRuleEngine,
    pub store: Arc<dyn BlockEventStore>,
    pub enforcer: Arc<dyn Enforcer>,
    pub reputation: Option<Arc<dyn ReputationLookup>>,
    pub events: EventBus,
    pub statistics: DefenseStatistics,
}

impl DefenseContext {
    pub fn from_config(
        config: &Config,
        store: Arc<dyn BlockEventStore>,
        enforcer: Arc<dyn Enforcer>,
    ) -> Result<Self, DefenseError> {
        let signatures = Arc::new(SignatureEngine::from_config(&config.signatures)?);
        info!("Loaded {} signatures", signatures.len());

        Ok(Self {
            detector: DdosDetectionEngine::new(config.detection.clone())?,
            analyzer: AdvancedPacketAnalyzer::new(config.analyzer.clone(), signatures),
            rate_limiter: Arc::new(RateLimitingService::new(config.rate_limit.clone())?),
            rule_engine: BlockRuleEngine::new(config.block_rules.clone()),
            store,
            enforcer,
            reputation: None,
            events: EventBus::default(),
            statistics: DefenseStatistics::new(),
        })
    }

    pub fn with_reputation(mut self, lookup: Arc<dyn ReputationLookup>) -> Self {
        self.reputation = Some(lookup);
        self
    }
}

/// What a traffic counter is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrafficKey {
    Process(u32),
    Source(IpAddr),
}

impl TrafficKey {
    pub fn for_packet(packet: &PacketRecord) -> Self {
        match packet.process_id {
            Some(pid) => TrafficKey::Process(pid),
            None => TrafficKey::Source(packet.src_ip),
        }
    }
}

impl fmt::Display for TrafficKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficKey::Process(pid) => write!(f, "process {}", pid),
            TrafficKey::Source(ip) => write!(f, "source {}", ip),
        }
    }
}

/// One-second packet window plus running totals for a process or source
#[derive(Debug)]
pub struct ProcessTrafficStats {
    key: TrafficKey,
    recent: VecDeque<DateTime<Utc>>,
    total_packets: u64,
    total_bytes: u64,
    last_seen: DateTime<Utc>,
    last_alert: Option<DateTime<Utc>>,
    latest: PacketRecord,
}

impl ProcessTrafficStats {
    pub fn new(key: TrafficKey, first: &PacketRecord) -> Self {
        Self {
            key,
            recent: VecDeque::new(),
            total_packets: 0,
            total_bytes: 0,
            last_seen: first.timestamp,
            last_alert: None,
            latest: first.clone(),
        }
    }

    pub fn record(&mut self, packet: &PacketRecord) {
        self.recent.push_back(packet.timestamp);
        self.total_packets += 1;
        self.total_bytes += u64::from(packet.length);
        if packet.timestamp >= self.last_seen {
            self.last_seen = packet.timestamp;
            self.latest = packet.clone();
        }
        let Some(cutoff) = self.last_seen.checked_sub_signed(Duration::seconds(1)) else {
            return;
        };
        while let Some(front) = self.recent.front() {
            if *front <= cutoff {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn packets_per_second(&self, now: DateTime<Utc>) -> f64 {
        self.recent
            .iter()
            .filter(|ts| within_window(**ts, now, Duration::seconds(1)))
            .count() as f64
    }

    pub fn key(&self) -> TrafficKey {
        self.key
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Most recent packet, used to describe the key to the rule engine
    pub fn latest(&self) -> &PacketRecord {
        &self.latest
    }
}

/// Counts from one analysis cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub packets: usize,
    pub bytes: u64,
    pub traffic_alerts: usize,
    pub detector_alerts: usize,
    pub advanced_alerts: usize,
    pub violations: usize,
    pub analysis_errors: usize,
    pub decisions: usize,
    pub mitigations: usize,
}

/// What `stop` did with the packets still queued
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopSummary {
    pub drained: usize,
    pub discarded: usize,
}

/// A source flagged for mitigation during one cycle
#[derive(Debug, Clone)]
struct MitigationCandidate {
    fact: ConnectionFact,
    process_id: Option<u32>,
    reasons: Vec<String>,
    rate_limit: Option<RateLimitViolation>,
}

impl MitigationCandidate {
    fn new(fact: ConnectionFact) -> Self {
        Self {
            process_id: fact.process_id,
            fact,
            reasons: Vec::new(),
            rate_limit: None,
        }
    }
}

struct RunningTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct DefenseOrchestrator {
    context: Arc<DefenseContext>,
    config: OrchestratorConfig,
    queue: SegQueue<PacketRecord>,
    /// Latest socket-table snapshot, consumed by the next cycle
    connections: Mutex<Option<Vec<ConnectionRecord>>>,
    running: AtomicBool,
    traffic: DashMap<TrafficKey, Arc<Mutex<ProcessTrafficStats>>>,
    /// Last mitigation per source, for the cooldown
    mitigated: DashMap<IpAddr, DateTime<Utc>>,
    /// Last published detector alert per (alert kind, source)
    alerted: DashMap<(String, IpAddr), DateTime<Utc>>,
    pending: Mutex<Vec<JoinHandle<()>>>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl DefenseOrchestrator {
    pub fn new(context: Arc<DefenseContext>, config: OrchestratorConfig) -> Self {
        Self {
            context,
            config,
            queue: SegQueue::new(),
            connections: Mutex::new(None),
            running: AtomicBool::new(false),
            traffic: DashMap::new(),
            mitigated: DashMap::new(),
            alerted: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            tasks: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<DefenseContext> {
        &self.context
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.traffic.len()
    }

    /// Opens packet intake and schedules the analysis cycle and sweeps.
    pub fn start(self: &Arc<Self>) -> Result<(), DefenseError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DefenseError::AlreadyRunning);
        }
        let (shutdown, shutdown_rx) = watch::channel(false);

        let tick = std::time::Duration::from_millis(self.config.tick_interval_ms.max(1));
        let cycle = {
            let this = Arc::clone(self);
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut interval = time::interval_at(Instant::now() + tick, tick);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => break,
                        _ = interval.tick() => {
                            this.run_cycle(Utc::now());
                        }
                    }
                }
                debug!("Analysis cycle stopped");
            })
        };

        let sweep_period = std::time::Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let sweep = {
            let this = Arc::clone(self);
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut interval = time::interval_at(Instant::now() + sweep_period, sweep_period);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => break,
                        _ = interval.tick() => {
                            this.sweep(Utc::now());
                        }
                    }
                }
                debug!("Tracker sweep stopped");
            })
        };

        let limiter_sweep = Arc::clone(&self.context.rate_limiter).spawn_cleanup_task(shutdown_rx);

        *self.tasks.lock() = Some(RunningTasks {
            shutdown,
            handles: vec![cycle, sweep, limiter_sweep],
        });
        info!(
            "Defense system started: {} ms cycle, {} packets/s flag threshold",
            self.config.tick_interval_ms, self.config.packets_per_second_threshold
        );
        Ok(())
    }

    /// Halts intake and cancels the cycle. Queued packets are run through one
    /// final cycle or discarded depending on `drain_on_stop`; detached
    /// mitigation tasks are awaited either way.
    pub async fn stop(&self) -> Result<StopSummary, DefenseError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(DefenseError::NotRunning);
        }

        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown.send(true);
            for result in futures::future::join_all(tasks.handles).await {
                if let Err(e) = result {
                    error!("Background task ended abnormally: {}", e);
                }
            }
        }

        let mut summary = StopSummary::default();
        if self.config.drain_on_stop {
            summary.drained = self.run_cycle(Utc::now()).packets;
        } else {
            while self.queue.pop().is_some() {
                summary.discarded += 1;
            }
            self.connections.lock().take();
            self.context.statistics.set_queue_depth(0);
        }
        self.flush_pending().await;

        info!(
            "Defense system stopped ({} packets drained, {} discarded)",
            summary.drained, summary.discarded
        );
        Ok(summary)
    }

    /// Queues a packet. Returns `false` when intake is closed or the packet
    /// timestamp is outside the accepted clock skew.
    pub fn submit(&self, packet: PacketRecord) -> bool {
        if !self.is_running() {
            debug!("Dropping packet from {}: defense system is stopped", packet.src_ip);
            return false;
        }
        if !self.timestamp_accepted(&packet, Utc::now()) {
            return false;
        }
        self.queue.push(packet);
        true
    }

    /// Queues every acceptable packet and returns how many were taken.
    pub fn submit_batch<I>(&self, packets: I) -> usize
    where
        I: IntoIterator<Item = PacketRecord>,
    {
        if !self.is_running() {
            debug!("Dropping packet batch: defense system is stopped");
            return 0;
        }
        let now = Utc::now();
        let mut accepted = 0;
        for packet in packets {
            if self.timestamp_accepted(&packet, now) {
                self.queue.push(packet);
                accepted += 1;
            }
        }
        accepted
    }

    /// Replaces the pending socket-table snapshot. The connection detectors
    /// run over it on the next cycle. Returns `false` when intake is closed.
    pub fn submit_connections(&self, connections: Vec<ConnectionRecord>) -> bool {
        if !self.is_running() {
            debug!("Dropping connection snapshot: defense system is stopped");
            return false;
        }
        *self.connections.lock() = Some(connections);
        true
    }

    fn timestamp_accepted(&self, packet: &PacketRecord, now: DateTime<Utc>) -> bool {
        let Some(max_skew) = self.config.max_timestamp_skew_secs else { return true };
        let skew = (packet.timestamp - now).num_seconds().abs();
        if skew > max_skew {
            warn!(
                "Refusing packet from {} stamped {} ({} s from the local clock)",
                packet.src_ip, packet.timestamp, skew
            );
            return false;
        }
        true
    }

    /// Waits for every detached enforcement and persistence task.
    pub async fn flush_pending(&self) {
        let handles = std::mem::take(&mut *self.pending.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Mitigation task ended abnormally: {}", e);
            }
        }
    }

    /// One analysis pass over everything queued so far.
    pub fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let mut packets = Vec::with_capacity(self.queue.len());
        while let Some(packet) = self.queue.pop() {
            packets.push(packet);
        }

        let stats = &self.context.statistics;
        let mut report = CycleReport {
            packets: packets.len(),
            bytes: packets.iter().map(|p| u64::from(p.length)).sum(),
            ..CycleReport::default()
        };
        stats.record_packets(report.packets as u64, report.bytes);
        stats.set_queue_depth(self.queue.len());

        let connections = self.connections.lock().take();

        // BTreeMap keeps mitigation order stable.
        let mut candidates: BTreeMap<IpAddr, MitigationCandidate> = BTreeMap::new();
        if !packets.is_empty() {
            self.update_traffic(&packets, now, &mut candidates, &mut report);
            let opened = self.run_detectors(&packets, now, &mut candidates, &mut report);
            self.apply_rate_limits(&packets, opened, &mut candidates, &mut report);
        }
        if let Some(connections) = connections {
            self.run_connection_detectors(&connections, now, &mut candidates, &mut report);
        }
        self.mitigate(candidates, now, &mut report);

        stats.set_tracked(self.context.analyzer.flow_count(), self.traffic.len());
        stats.record_cycle();
        if report.packets > 0 {
            debug!(
                "Cycle: {} packets, {} alerts, {} violations, {} mitigations",
                report.packets,
                report.traffic_alerts + report.detector_alerts + report.advanced_alerts,
                report.violations,
                report.mitigations
            );
        }
        report
    }

    /// Connection-summary detectors over a socket-table snapshot. A snapshot
    /// describes standing state, so each (attack, source) alerts once per
    /// cooldown.
    fn run_connection_detectors(
        &self,
        connections: &[ConnectionRecord],
        now: DateTime<Utc>,
        candidates: &mut BTreeMap<IpAddr, MitigationCandidate>,
        report: &mut CycleReport,
    ) {
        for alert in self.context.detector.analyze_connections(connections, now) {
            let kind = format!("connections/{}", alert.attack_type);
            if !self.first_in_cooldown(kind, alert.source_ip, now) {
                debug!("{} from {} in alert cooldown", alert.attack_type, alert.source_ip);
                continue;
            }
            self.publish_alert(&alert);
            report.detector_alerts += 1;
            if alert.severity >= self.config.auto_mitigate_min_severity {
                let source = alert.source_ip;
                candidates
                    .entry(source)
                    .or_insert_with(|| {
                        let mut fact = connections
                            .iter()
                            .find(|c| c.remote_ip == source)
                            .map(connection_fact)
                            .unwrap_or_else(|| ConnectionFact::new(source, now));
                        fact.observed_at = now;
                        MitigationCandidate::new(fact)
                    })
                    .reasons
                    .push(alert.description);
            }
        }
    }

    /// Records an alert for `(kind, source)` and returns `true` unless one
    /// was already recorded inside the alert cooldown.
    fn first_in_cooldown(&self, kind: String, source: IpAddr, now: DateTime<Utc>) -> bool {
        let cooldown = Duration::seconds(self.config.alert_cooldown_secs);
        match self.alerted.entry((kind, source)) {
            Entry::Occupied(mut last) => {
                if now - *last.get() < cooldown {
                    return false;
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        true
    }

    fn update_traffic(
        &self,
        packets: &[PacketRecord],
        now: DateTime<Utc>,
        candidates: &mut BTreeMap<IpAddr, MitigationCandidate>,
        report: &mut CycleReport,
    ) {
        let mut touched = HashSet::new();
        for packet in packets {
            let key = TrafficKey::for_packet(packet);
            let entry = self
                .traffic
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(ProcessTrafficStats::new(key, packet))))
                .clone();
            entry.lock().record(packet);
            touched.insert(key);
        }

        let cooldown = Duration::seconds(self.config.alert_cooldown_secs);
        let threshold = self.config.packets_per_second_threshold;
        for key in touched {
            let Some(entry) = self.traffic.get(&key).map(|e| e.clone()) else { continue };
            let mut traffic = entry.lock();

            let pps = traffic.packets_per_second(now);
            if pps <= threshold {
                continue;
            }
            if traffic.last_alert.map_or(false, |at| now - at < cooldown) {
                debug!("{} still in alert cooldown", key);
                continue;
            }
            traffic.last_alert = Some(now);

            let latest = traffic.latest().clone();
            let alert = DdosAlert::new(
                AttackType::HighTrafficRate,
                Severity::from_ratio(pps, threshold),
                latest.src_ip,
                format!("{:.0} packets/s from {}", pps, key),
                now,
            )
            .with_destination(Some(latest.dst_ip))
            .with_counts(traffic.total_packets(), 0, traffic.total_bytes());
            drop(traffic);

            warn!("{}", alert.description);
            self.publish_alert(&alert);
            report.traffic_alerts += 1;

            let mut fact = ConnectionFact::from_packet(&latest);
            fact.observed_at = now;
            candidates
                .entry(latest.src_ip)
                .or_insert_with(|| MitigationCandidate::new(fact))
                .reasons
                .push(alert.description);
        }
    }

    /// Returns the UDP sessions and ICMP flows this batch opened.
    fn run_detectors(
        &self,
        packets: &[PacketRecord],
        now: DateTime<Utc>,
        candidates: &mut BTreeMap<IpAddr, MitigationCandidate>,
        report: &mut CycleReport,
    ) -> HashSet<FlowKey> {
        let min_severity = self.config.auto_mitigate_min_severity;

        for alert in self.context.detector.analyze_packets(packets, now) {
            self.publish_alert(&alert);
            report.detector_alerts += 1;
            if alert.severity >= min_severity {
                let reason = alert.description.clone();
                self.flag_source(candidates, packets, alert.source_ip, now, reason);
            }
        }

        let analysis = self.context.analyzer.analyze_batch(packets, now);
        for failure in analysis.signature_failures {
            error!("Signature {} failed: {}", failure.signature_id, failure.message);
            self.context.statistics.record_analysis_error();
            self.context.events.publish(DefenseEvent::AnalysisError {
                stage: format!("signature {}", failure.signature_id),
                message: failure.message,
            });
            report.analysis_errors += 1;
        }
        for alert in analysis.alerts {
            // Signatures and size anomalies look back over retained windows
            // and would otherwise repeat on every cycle.
            let kind = alert
                .signature_id
                .clone()
                .unwrap_or_else(|| alert.alert.attack_type.to_string());
            if !self.first_in_cooldown(kind, alert.alert.source_ip, now) {
                debug!(
                    "{} from {} in alert cooldown",
                    alert.alert.attack_type, alert.alert.source_ip
                );
                continue;
            }
            warn!(
                "{} from {} (confidence {:.0})",
                alert.alert.attack_type, alert.alert.source_ip, alert.confidence
            );
            self.context.statistics.record_advanced_alert();
            report.advanced_alerts += 1;
            if alert.alert.severity >= min_severity {
                self.flag_source(
                    candidates,
                    packets,
                    alert.alert.source_ip,
                    now,
                    alert.alert.description.clone(),
                );
            }
            self.context.events.publish(DefenseEvent::AdvancedAlert(alert));
        }
        analysis.opened_flows
    }

    fn apply_rate_limits(
        &self,
        packets: &[PacketRecord],
        mut opened: HashSet<FlowKey>,
        candidates: &mut BTreeMap<IpAddr, MitigationCandidate>,
        report: &mut CycleReport,
    ) {
        let mut published = HashSet::new();
        for packet in packets.iter().filter(|p| is_connection_attempt(p, &mut opened)) {
            let attempt = ConnectionAttempt::from_packet(packet);
            let decision = self.context.rate_limiter.check_limit(&attempt);
            for violation in decision.violations {
                self.context.statistics.record_violation();
                report.violations += 1;

                if violation.scope == LimitScope::Ip {
                    let candidate = candidates.entry(packet.src_ip).or_insert_with(|| {
                        MitigationCandidate::new(ConnectionFact::from_packet(packet))
                    });
                    if candidate.rate_limit.is_none() {
                        candidate.rate_limit = Some(violation.clone());
                    }
                }
                // One event per limiter per cycle.
                if published.insert((violation.scope, violation.identity.clone())) {
                    warn!("Rate limit: {}", violation.detail);
                    self.context.events.publish(DefenseEvent::RateLimitViolation(violation));
                }
            }
        }
    }

    fn publish_alert(&self, alert: &DdosAlert) {
        self.context.statistics.record_alert();
        self.context.events.publish(DefenseEvent::DdosAlert(alert.clone()));
    }

    fn flag_source(
        &self,
        candidates: &mut BTreeMap<IpAddr, MitigationCandidate>,
        packets: &[PacketRecord],
        source: IpAddr,
        now: DateTime<Utc>,
        reason: String,
    ) {
        let candidate = candidates.entry(source).or_insert_with(|| {
            let fact = packets
                .iter()
                .rev()
                .find(|p| p.src_ip == source)
                .map(ConnectionFact::from_packet)
                .unwrap_or_else(|| ConnectionFact::new(source, now));
            MitigationCandidate::new(fact)
        });
        candidate.reasons.push(reason);
    }

    fn mitigate(
        &self,
        candidates: BTreeMap<IpAddr, MitigationCandidate>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let cooldown = Duration::seconds(self.config.alert_cooldown_secs);

        for (source, candidate) in candidates {
            if self.mitigated.get(&source).map_or(false, |at| now - *at < cooldown) {
                debug!("{} mitigated recently, skipping", source);
                continue;
            }

            self.schedule_reputation_refresh(source, now);

            let decision = self.context.rule_engine.evaluate(&candidate.fact);
            self.context.statistics.record_decision();
            report.decisions += 1;

            let rate_limited = candidate.rate_limit.is_some();
            if decision.level == BlockLevel::None && !rate_limited {
                debug!(
                    "{} flagged ({}) but allowed: {}",
                    source,
                    candidate.reasons.join("; "),
                    decision.reason
                );
                continue;
            }
            self.mitigated.insert(source, now);
            report.mitigations += 1;

            let duration = match (&candidate.rate_limit, decision.should_block()) {
                (_, true) => Some(BlockDuration::Seconds(self.config.block_duration_secs)),
                (Some(violation), false) => {
                    Some(BlockDuration::Seconds(violation.remaining_block_secs.max(1) as u64))
                }
                (None, false) => None,
            };
            if let Some(duration) = duration {
                if is_internal_address(&source) {
                    info!("Not enforcing a block on internal address {}", source);
                } else {
                    self.dispatch_block(BlockTarget::Ip(source), duration);
                }
            }

            let record = block_record(&candidate, &decision);
            self.dispatch_persist(record);
        }
    }

    fn schedule_reputation_refresh(&self, source: IpAddr, now: DateTime<Utc>) {
        let Some(lookup) = self.context.reputation.clone() else { return };
        if is_internal_address(&source)
            || self.context.rule_engine.cached_reputation(source, now).is_some()
        {
            return;
        }
        let context = Arc::clone(&self.context);
        self.detach(async move {
            context
                .rule_engine
                .refresh_reputation(lookup.as_ref(), source, Utc::now())
                .await;
        });
    }

    fn dispatch_block(&self, target: BlockTarget, duration: BlockDuration) {
        let context = Arc::clone(&self.context);
        self.detach(async move {
            let result = match context.enforcer.apply_block(target, duration).await {
                Ok(()) => {
                    info!("Blocked {} {}", target, duration);
                    context.statistics.record_block(true);
                    DefenseActionResult::succeeded(DefenseAction::ApplyBlock, Some(target))
                }
                Err(e) => {
                    error!("Failed to block {}: {}", target, e);
                    context.statistics.record_block(false);
                    let message = e.to_string();
                    DefenseActionResult::failed(DefenseAction::ApplyBlock, Some(target), message)
                }
            };
            context.events.publish(DefenseEvent::ActionResult(result));
        });
    }

    fn dispatch_persist(&self, record: BlockEventRecord) {
        let context = Arc::clone(&self.context);
        self.detach(async move {
            let target = Some(BlockTarget::Ip(record.remote_address));
            let result = match context.store.record_block_event(record).await {
                Ok(()) => DefenseActionResult::succeeded(DefenseAction::PersistBlockEvent, target),
                Err(e) => {
                    error!("Failed to persist block event: {}", e);
                    context.statistics.record_persistence_failure();
                    let message = e.to_string();
                    DefenseActionResult::failed(DefenseAction::PersistBlockEvent, target, message)
                }
            };
            context.events.publish(DefenseEvent::ActionResult(result));
        });
    }

    fn detach<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Lifts an active block through the enforcer and clears the IP limiter.
    pub async fn remove_block(&self, ip: IpAddr) -> DefenseActionResult {
        self.context.rate_limiter.unblock_ip(ip);
        self.mitigated.remove(&ip);
        let target = BlockTarget::Ip(ip);
        let result = match self.context.enforcer.remove_block(target).await {
            Ok(()) => {
                info!("Unblocked {}", ip);
                DefenseActionResult::succeeded(DefenseAction::RemoveBlock, Some(target))
            }
            Err(e) => {
                warn!("Failed to unblock {}: {}", ip, e);
                DefenseActionResult::failed(DefenseAction::RemoveBlock, Some(target), e.to_string())
            }
        };
        self.context.events.publish(DefenseEvent::ActionResult(result.clone()));
        result
    }

    /// Evicts idle trackers, traffic counters, expired cooldowns and stale
    /// reputation verdicts. Runs on its own timer, never inside a cycle.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let trackers = self.context.analyzer.cleanup_idle(now);

        let idle_cutoff = now - Duration::seconds(self.config.traffic_idle_secs);
        let before = self.traffic.len();
        self.traffic.retain(|_, stats| stats.lock().last_seen() >= idle_cutoff);
        let counters = before - self.traffic.len();

        let cooldown = Duration::seconds(self.config.alert_cooldown_secs);
        self.mitigated.retain(|_, at| now - *at < cooldown);
        self.alerted.retain(|_, at| now - *at < cooldown);
        let reputations = self.context.rule_engine.prune_reputation(now);

        if counters > 0 || reputations > 0 {
            info!(
                "Sweep removed {} traffic counters and {} reputation entries",
                counters, reputations
            );
        }
        trackers + counters
    }
}

/// A bare SYN, or the first packet of a UDP session or ICMP flow opened in
/// this batch.
fn is_connection_attempt(packet: &PacketRecord, opened: &mut HashSet<FlowKey>) -> bool {
    match packet.protocol {
        Protocol::Tcp => packet.tcp_flags.is_syn_only(),
        _ => opened.remove(&FlowKey::from_packet(packet)),
    }
}

fn connection_fact(record: &ConnectionRecord) -> ConnectionFact {
    let mut fact = ConnectionFact::new(record.remote_ip, record.opened_at)
        .with_remote_port(record.remote_port)
        .with_local_port(record.local_port)
        .with_bytes(record.total_bytes());
    fact.protocol = record.protocol;
    if let Some(pid) = record.process_id {
        fact = fact.with_process(pid, record.process_name.clone().unwrap_or_default());
    }
    fact
}

fn block_record(candidate: &MitigationCandidate, decision: &BlockDecision) -> BlockEventRecord {
    let mut record = BlockEventRecord::from_decision(&candidate.fact, decision);
    if let Some(violation) = &candidate.rate_limit {
        if decision.level < BlockLevel::Immediate {
            record.block_level = BlockLevel::Immediate;
            record.reason = violation.detail.clone();
        }
        record.triggered_rules.push(format!("RateLimit{:?}", violation.violation_type));
    }
    if record.process_id.is_none() {
        record.process_id = candidate.process_id;
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::enforcement::{EnforcementError, LogOnlyEnforcer, MockEnforcer};
    use crate::core::packet::{ConnectionState, TcpFlags};
    use crate::core::store::{MemoryBlockStore, MockBlockEventStore, StoreError};
    use chrono::TimeZone;
    use tokio_test::assert_ok;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn orchestrator(
        store: Arc<dyn BlockEventStore>,
        enforcer: Arc<dyn Enforcer>,
        config: OrchestratorConfig,
    ) -> Arc<DefenseOrchestrator> {
        let context = DefenseContext::from_config(&Config::default(), store, enforcer).unwrap();
        Arc::new(DefenseOrchestrator::new(Arc::new(context), config))
    }

    fn quiet_config() -> OrchestratorConfig {
        OrchestratorConfig {
            tick_interval_ms: 3_600_000,
            sweep_interval_secs: 3600,
            max_timestamp_skew_secs: None,
            ..OrchestratorConfig::default()
        }
    }

    /// 150 SYNs from one source to varying ports inside one second.
    fn syn_burst(end: DateTime<Utc>) -> Vec<PacketRecord> {
        (0..150)
            .map(|i| {
                PacketRecord::tcp(
                    end - Duration::milliseconds((149 - i) * 5),
                    (ip("203.0.113.9"), 40000 + i as u16),
                    (ip("10.0.0.1"), 1000 + i as u16),
                    60,
                    TcpFlags::SYN,
                )
            })
            .collect()
    }

    fn ack_stream(end: DateTime<Utc>, count: i64) -> Vec<PacketRecord> {
        (0..count)
            .map(|i| {
                PacketRecord::tcp(
                    end - Duration::milliseconds((count - 1 - i) * 9),
                    (ip("198.51.100.20"), 40000),
                    (ip("10.0.0.1"), 443),
                    200 + (i as u32 % 7) * 100,
                    TcpFlags::ACK,
                )
            })
            .collect()
    }

    fn udp_session(end: DateTime<Utc>, src_port: u16, count: i64) -> Vec<PacketRecord> {
        (0..count)
            .map(|i| {
                PacketRecord::udp(
                    end - Duration::milliseconds((count - 1 - i) * 40),
                    (ip("203.0.113.40"), src_port),
                    (ip("10.0.0.1"), 3478),
                    160 + (i as u32 % 4) * 50,
                )
            })
            .collect()
    }

    /// Established web connections held open a minute with almost no data.
    fn slow_connections(now: DateTime<Utc>, count: u16) -> Vec<ConnectionRecord> {
        (0..count)
            .map(|i| ConnectionRecord {
                protocol: Protocol::Tcp,
                local_ip: ip("10.0.0.1"),
                local_port: 80,
                remote_ip: ip("198.51.100.99"),
                remote_port: 30000 + i,
                state: ConnectionState::Established,
                opened_at: now - Duration::seconds(60),
                bytes_sent: 40,
                bytes_received: 60,
                process_id: None,
                process_name: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn syn_burst_is_rate_limited_blocked_and_persisted() {
        let mut enforcer = MockEnforcer::new();
        enforcer
            .expect_apply_block()
            .withf(|target, _| *target == BlockTarget::Ip("203.0.113.9".parse().unwrap()))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut store = MockBlockEventStore::new();
        store
            .expect_record_block_event()
            .withf(|record| record.triggered_rules.iter().any(|r| r == "RateLimitConnectionRate"))
            .times(1)
            .returning(|_| Ok(()));

        let orchestrator = orchestrator(Arc::new(store), Arc::new(enforcer), quiet_config());
        let mut events = orchestrator.context().events.subscribe();
        assert_ok!(orchestrator.start());

        let now = Utc::now();
        assert_eq!(orchestrator.submit_batch(syn_burst(now)), 150);
        let report = orchestrator.run_cycle(now);
        orchestrator.flush_pending().await;

        assert_eq!(report.packets, 150);
        assert_eq!(report.traffic_alerts, 1);
        assert!(report.detector_alerts >= 1);
        assert_eq!(report.violations, 140);
        assert_eq!(report.mitigations, 1);
        assert!(orchestrator.context().rate_limiter.is_ip_blocked(ip("203.0.113.9"), now));

        let mut violations = 0;
        let mut applied = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                DefenseEvent::RateLimitViolation(_) => violations += 1,
                DefenseEvent::ActionResult(result)
                    if result.action == DefenseAction::ApplyBlock =>
                {
                    assert!(result.success);
                    applied += 1;
                }
                _ => {}
            }
        }
        assert_eq!(violations, 1);
        assert_eq!(applied, 1);

        let snapshot = orchestrator.context().statistics.snapshot();
        assert_eq!(snapshot.blocks_applied, 1);
        assert_eq!(snapshot.rate_limit_violations, 140);
        assert_ok!(orchestrator.stop().await);
    }

    #[tokio::test]
    async fn failing_collaborators_do_not_abort_the_cycle() {
        let mut enforcer = MockEnforcer::new();
        enforcer
            .expect_apply_block()
            .returning(|target, _| Err(EnforcementError::Unsupported(target)));
        let mut store = MockBlockEventStore::new();
        store.expect_record_block_event().returning(|_| {
            Err(StoreError::SerializationError(
                serde_json::from_str::<serde_json::Value>("{").unwrap_err(),
            ))
        });

        let orchestrator = orchestrator(Arc::new(store), Arc::new(enforcer), quiet_config());
        let mut events = orchestrator.context().events.subscribe();
        orchestrator.start().unwrap();

        let now = Utc::now();
        orchestrator.submit_batch(syn_burst(now));
        let report = orchestrator.run_cycle(now);
        orchestrator.flush_pending().await;
        assert_eq!(report.mitigations, 1);

        let mut failures = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DefenseEvent::ActionResult(result) = event {
                assert!(!result.success);
                assert!(result.message.is_some());
                failures.push(result.action);
            }
        }
        assert!(failures.contains(&DefenseAction::ApplyBlock));
        assert!(failures.contains(&DefenseAction::PersistBlockEvent));

        let snapshot = orchestrator.context().statistics.snapshot();
        assert_eq!(snapshot.blocks_failed, 1);
        assert_eq!(snapshot.persistence_failures, 1);

        // The next cycle still runs.
        assert_eq!(orchestrator.run_cycle(now + Duration::seconds(1)).packets, 0);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn steady_udp_session_is_not_rate_limited() {
        let mut enforcer = MockEnforcer::new();
        enforcer.expect_apply_block().times(0);
        let orchestrator = orchestrator(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(enforcer),
            quiet_config(),
        );
        orchestrator.start().unwrap();

        let now = Utc::now();
        orchestrator.submit_batch(udp_session(now, 50000, 20));
        let report = orchestrator.run_cycle(now);
        orchestrator.flush_pending().await;

        assert_eq!(report.packets, 20);
        assert_eq!(report.violations, 0);
        assert_eq!(report.mitigations, 0);
        assert!(!orchestrator.context().rate_limiter.is_ip_blocked(ip("203.0.113.40"), now));

        // Later packets on the same session are not new attempts either.
        let later = now + Duration::seconds(1);
        orchestrator.submit_batch(udp_session(later, 50000, 20));
        assert_eq!(orchestrator.run_cycle(later).violations, 0);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn new_udp_sessions_count_as_connection_attempts() {
        let orchestrator = orchestrator(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(LogOnlyEnforcer),
            quiet_config(),
        );
        orchestrator.start().unwrap();

        let now = Utc::now();
        let packets: Vec<PacketRecord> = (0..15)
            .map(|i| {
                let mut packet = udp_session(now, 50000 + i as u16, 1).remove(0);
                packet.timestamp = now - Duration::milliseconds((14 - i) * 20);
                packet
            })
            .collect();
        orchestrator.submit_batch(packets);
        let report = orchestrator.run_cycle(now);

        assert_eq!(report.violations, 5);
        assert!(orchestrator.context().rate_limiter.is_ip_blocked(ip("203.0.113.40"), now));
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn packets_far_from_the_clock_are_refused() {
        let orchestrator = orchestrator(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(LogOnlyEnforcer),
            OrchestratorConfig {
                tick_interval_ms: 3_600_000,
                ..OrchestratorConfig::default()
            },
        );
        orchestrator.start().unwrap();

        let ancient = udp_session(DateTime::<Utc>::MIN_UTC, 50000, 1).remove(0);
        assert!(!orchestrator.submit(ancient.clone()));
        let current = udp_session(Utc::now(), 50000, 1).remove(0);
        assert_eq!(orchestrator.submit_batch(vec![ancient, current]), 1);
        assert_eq!(orchestrator.queue_len(), 1);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn extreme_timestamps_do_not_abort_the_cycle() {
        let orchestrator = orchestrator(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(LogOnlyEnforcer),
            quiet_config(),
        );
        orchestrator.start().unwrap();

        let earliest = DateTime::<Utc>::MIN_UTC;
        orchestrator.submit_batch(vec![
            udp_session(earliest, 50000, 1).remove(0),
            PacketRecord::tcp(
                earliest,
                (ip("203.0.113.41"), 40000),
                (ip("10.0.0.1"), 80),
                60,
                TcpFlags::SYN,
            ),
            PacketRecord::icmp(earliest, ip("203.0.113.42"), ip("10.0.0.1"), 84),
        ]);
        let now = Utc::now();
        assert_eq!(orchestrator.run_cycle(now).packets, 3);

        orchestrator.submit_batch(ack_stream(now, 5));
        assert_eq!(orchestrator.run_cycle(now).packets, 5);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn connection_snapshot_alerts_and_mitigates() {
        let attacker = ip("198.51.100.99");
        let mut enforcer = MockEnforcer::new();
        enforcer
            .expect_apply_block()
            .withf(move |target, _| *target == BlockTarget::Ip(attacker))
            .times(1)
            .returning(|_, _| Ok(()));
        let store = Arc::new(MemoryBlockStore::default());
        let orchestrator = orchestrator(store.clone(), Arc::new(enforcer), quiet_config());
        orchestrator.context().rule_engine.add_malicious_ip(attacker);
        let mut events = orchestrator.context().events.subscribe();

        let now = Utc::now();
        assert!(!orchestrator.submit_connections(slow_connections(now, 30)));
        orchestrator.start().unwrap();
        assert!(orchestrator.submit_connections(slow_connections(now, 30)));

        let report = orchestrator.run_cycle(now);
        orchestrator.flush_pending().await;
        assert_eq!(report.packets, 0);
        assert_eq!(report.detector_alerts, 1);
        assert_eq!(report.mitigations, 1);
        assert_eq!(store.len(), 1);

        let mut slowloris = 0;
        while let Ok(event) = events.try_recv() {
            if let DefenseEvent::DdosAlert(alert) = event {
                assert_eq!(alert.attack_type, AttackType::Slowloris);
                assert_eq!(alert.source_ip, attacker);
                assert_eq!(alert.severity, Severity::High);
                slowloris += 1;
            }
        }
        assert_eq!(slowloris, 1);

        // The snapshot is consumed; a resubmitted one inside the cooldown stays quiet.
        assert_eq!(orchestrator.run_cycle(now).detector_alerts, 0);
        let later = now + Duration::seconds(2);
        orchestrator.submit_connections(slow_connections(later, 30));
        let report = orchestrator.run_cycle(later);
        assert_eq!(report.detector_alerts, 0);
        assert_eq!(report.mitigations, 0);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn signature_alerts_are_not_repeated_within_the_cooldown() {
        let orchestrator = orchestrator(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(LogOnlyEnforcer),
            quiet_config(),
        );
        let mut events = orchestrator.context().events.subscribe();
        orchestrator.start().unwrap();

        let syn_signature_alerts = |events: &mut tokio::sync::broadcast::Receiver<DefenseEvent>| {
            let mut count = 0;
            while let Ok(event) = events.try_recv() {
                if let DefenseEvent::AdvancedAlert(alert) = event {
                    if alert.signature_id.as_deref() == Some("SIG-SYN-FLOOD") {
                        count += 1;
                    }
                }
            }
            count
        };

        let now = Utc::now();
        orchestrator.submit_batch(syn_burst(now));
        orchestrator.run_cycle(now);
        assert_eq!(syn_signature_alerts(&mut events), 1);

        // Unrelated traffic two seconds later re-runs the scan over the
        // retained burst.
        let later = now + Duration::seconds(2);
        orchestrator.submit_batch(ack_stream(later, 10));
        orchestrator.run_cycle(later);
        assert_eq!(syn_signature_alerts(&mut events), 0);

        orchestrator.flush_pending().await;
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn alerts_and_mitigations_respect_the_cooldown() {
        let store = Arc::new(MemoryBlockStore::default());
        let orchestrator = orchestrator(store.clone(), Arc::new(LogOnlyEnforcer), quiet_config());
        orchestrator.start().unwrap();

        let first = base();
        orchestrator.submit_batch(ack_stream(first, 100));
        assert_eq!(orchestrator.run_cycle(first).traffic_alerts, 1);

        let second = first + Duration::seconds(2);
        orchestrator.submit_batch(ack_stream(second, 100));
        let report = orchestrator.run_cycle(second);
        assert_eq!(report.traffic_alerts, 0);
        assert_eq!(report.mitigations, 0);

        let third = first + Duration::seconds(11);
        orchestrator.submit_batch(ack_stream(third, 100));
        assert_eq!(orchestrator.run_cycle(third).traffic_alerts, 1);

        orchestrator.flush_pending().await;
        assert_eq!(store.len(), 2);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn quiet_traffic_is_not_flagged() {
        let store = Arc::new(MemoryBlockStore::default());
        let orchestrator = orchestrator(store.clone(), Arc::new(LogOnlyEnforcer), quiet_config());
        orchestrator.start().unwrap();

        orchestrator.submit_batch(ack_stream(base(), 20));
        let report = orchestrator.run_cycle(base());
        orchestrator.flush_pending().await;

        assert_eq!(report.packets, 20);
        assert_eq!(report.traffic_alerts, 0);
        assert_eq!(report.mitigations, 0);
        assert!(store.is_empty());
        assert_eq!(orchestrator.tracked_keys(), 1);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_drains_queued_packets_when_configured() {
        let orchestrator = orchestrator(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(LogOnlyEnforcer),
            OrchestratorConfig {
                drain_on_stop: true,
                ..quiet_config()
            },
        );
        orchestrator.start().unwrap();
        orchestrator.submit_batch(ack_stream(Utc::now(), 5));

        let summary = orchestrator.stop().await.unwrap();
        assert_eq!(summary, StopSummary { drained: 5, discarded: 0 });
        assert_eq!(orchestrator.context().statistics.snapshot().packets_processed, 5);
        assert!(!orchestrator.submit(ack_stream(Utc::now(), 1).remove(0)));
    }

    #[tokio::test]
    async fn stop_discards_queued_packets_when_configured() {
        let orchestrator = orchestrator(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(LogOnlyEnforcer),
            OrchestratorConfig {
                drain_on_stop: false,
                ..quiet_config()
            },
        );
        orchestrator.start().unwrap();
        orchestrator.submit_batch(ack_stream(Utc::now(), 5));

        let summary = orchestrator.stop().await.unwrap();
        assert_eq!(summary, StopSummary { drained: 0, discarded: 5 });
        assert_eq!(orchestrator.context().statistics.snapshot().packets_processed, 0);
        assert_eq!(orchestrator.queue_len(), 0);
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let orchestrator = orchestrator(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(LogOnlyEnforcer),
            quiet_config(),
        );
        assert!(matches!(orchestrator.stop().await, Err(DefenseError::NotRunning)));
        orchestrator.start().unwrap();
        assert!(matches!(orchestrator.start(), Err(DefenseError::AlreadyRunning)));
        orchestrator.stop().await.unwrap();
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn running_cycle_picks_up_submitted_packets() {
        let orchestrator = orchestrator(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(LogOnlyEnforcer),
            OrchestratorConfig {
                tick_interval_ms: 10,
                ..quiet_config()
            },
        );
        orchestrator.start().unwrap();
        orchestrator.submit_batch(ack_stream(Utc::now(), 3));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(orchestrator.queue_len(), 0);
        assert_eq!(orchestrator.context().statistics.snapshot().packets_processed, 3);
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn manual_unblock_clears_limiter_and_enforcer() {
        let mut enforcer = MockEnforcer::new();
        enforcer.expect_apply_block().returning(|_, _| Ok(()));
        enforcer
            .expect_remove_block()
            .withf(|target| *target == BlockTarget::Ip("203.0.113.9".parse().unwrap()))
            .times(1)
            .returning(|_| Ok(()));

        let orchestrator = orchestrator(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(enforcer),
            quiet_config(),
        );
        orchestrator.start().unwrap();
        let now = Utc::now();
        orchestrator.submit_batch(syn_burst(now));
        orchestrator.run_cycle(now);
        orchestrator.flush_pending().await;
        assert!(orchestrator.context().rate_limiter.is_ip_blocked(ip("203.0.113.9"), now));

        let result = orchestrator.remove_block(ip("203.0.113.9")).await;
        assert!(result.success);
        assert!(!orchestrator.context().rate_limiter.is_ip_blocked(ip("203.0.113.9"), now));
        orchestrator.stop().await.unwrap();
    }

    #[test]
    fn sweep_drops_idle_traffic_counters() {
        let orchestrator = orchestrator(
            Arc::new(MemoryBlockStore::default()),
            Arc::new(LogOnlyEnforcer),
            quiet_config(),
        );
        orchestrator.running.store(true, Ordering::SeqCst);
        orchestrator.submit_batch(ack_stream(base(), 3));
        orchestrator.run_cycle(base());
        assert_eq!(orchestrator.tracked_keys(), 1);

        assert_eq!(orchestrator.sweep(base() + Duration::minutes(2)), 0);
        assert!(orchestrator.sweep(base() + Duration::minutes(11)) >= 1);
        assert_eq!(orchestrator.tracked_keys(), 0);
    }
}
