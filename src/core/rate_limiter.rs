//! Sliding-window rate limiting keyed by remote IP, local port and process.
//!
//! Each key owns one limiter holding the timestamps (and byte counts) of its
//! attempts over the last minute. A limiter that trips enters a blocked state
//! for its family's block duration and is implicitly released afterwards.

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::packet::PacketRecord;
use crate::utils::within_window;

/// Errors that can occur when configuring rate limiting
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Invalid {scope} limit: {reason}")]
    InvalidLimit { scope: LimitScope, reason: String },
}

/// Limits applied to one limiter family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    pub max_per_second: u32,
    pub max_per_minute: u32,
    /// Only enforced by the IP family
    pub max_bytes_per_second: Option<u64>,
    pub block_duration_secs: i64,
}

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub ip: LimiterSettings,
    pub port: LimiterSettings,
    pub process: LimiterSettings,
    /// Limiters idle for longer than this are swept
    pub idle_timeout_secs: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip: LimiterSettings {
                max_per_second: 10,
                max_per_minute: 100,
                max_bytes_per_second: Some(5 * 1024 * 1024),
                block_duration_secs: 300,
            },
            port: LimiterSettings {
                max_per_second: 100,
                max_per_minute: 1000,
                max_bytes_per_second: None,
                block_duration_secs: 60,
            },
            process: LimiterSettings {
                max_per_second: 50,
                max_per_minute: 500,
                max_bytes_per_second: None,
                block_duration_secs: 120,
            },
            idle_timeout_secs: 600,
            cleanup_interval_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), RateLimitError> {
        for (scope, settings) in [
            (LimitScope::Ip, &self.ip),
            (LimitScope::Port, &self.port),
            (LimitScope::Process, &self.process),
        ] {
            let invalid = |reason: &str| RateLimitError::InvalidLimit {
                scope,
                reason: reason.to_string(),
            };
            if settings.max_per_second == 0 || settings.max_per_minute == 0 {
                return Err(invalid("connection limits must be positive"));
            }
            if settings.block_duration_secs <= 0 {
                return Err(invalid("block duration must be positive"));
            }
            if settings.max_bytes_per_second == Some(0) {
                return Err(invalid("byte limit must be positive"));
            }
        }
        Ok(())
    }
}

/// Which limiter family raised a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitScope {
    Ip,
    Port,
    Process,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::Ip => f.write_str("IP"),
            LimitScope::Port => f.write_str("port"),
            LimitScope::Process => f.write_str("process"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationType {
    ConnectionRate,
    ConnectionsPerMinute,
    Bandwidth,
}

/// A rejected attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitViolation {
    /// For a limiter that is already blocked, the violation that caused the block
    pub violation_type: ViolationType,
    pub scope: LimitScope,
    pub identity: String,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
    pub remaining_block_secs: i64,
}

/// One connection attempt as seen by the limiters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionAttempt {
    pub timestamp: DateTime<Utc>,
    pub remote_ip: IpAddr,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub bytes: u64,
}

impl ConnectionAttempt {
    pub fn new(timestamp: DateTime<Utc>, remote_ip: IpAddr) -> Self {
        Self {
            timestamp,
            remote_ip,
            local_port: None,
            process_id: None,
            bytes: 0,
        }
    }

    pub fn with_port(mut self, local_port: u16) -> Self {
        self.local_port = Some(local_port);
        self
    }

    pub fn with_process(mut self, process_id: u32) -> Self {
        self.process_id = Some(process_id);
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    /// Inbound view of a packet: the sender is remote, the destination port local.
    pub fn from_packet(packet: &PacketRecord) -> Self {
        Self {
            timestamp: packet.timestamp,
            remote_ip: packet.src_ip,
            local_port: packet.dst_port,
            process_id: packet.process_id,
            bytes: u64::from(packet.length),
        }
    }
}

/// Outcome of [`RateLimitingService::check_limit`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitDecision {
    pub violations: Vec<RateLimitViolation>,
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Currently blocked key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedEntry {
    pub scope: LimitScope,
    pub identity: String,
    pub reason: ViolationType,
    pub blocked_at: DateTime<Utc>,
    pub remaining_secs: i64,
}

#[derive(Debug)]
struct SlidingWindowLimiter {
    events: VecDeque<(DateTime<Utc>, u64)>,
    blocked_at: Option<DateTime<Utc>>,
    block_reason: ViolationType,
    last_activity: DateTime<Utc>,
}

impl SlidingWindowLimiter {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            events: VecDeque::new(),
            blocked_at: None,
            block_reason: ViolationType::ConnectionRate,
            last_activity: now,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let Some(cutoff) = now.checked_sub_signed(Duration::minutes(1)) else {
            return;
        };
        while let Some((ts, _)) = self.events.front() {
            if *ts <= cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn remaining_block(&self, now: DateTime<Utc>, duration: Duration) -> Option<Duration> {
        let remaining = self.blocked_at?.checked_add_signed(duration)? - now;
        (remaining > Duration::zero()).then_some(remaining)
    }

    fn second_totals(&self, now: DateTime<Utc>) -> (u64, u64) {
        self.events
            .iter()
            .rev()
            .filter(|(ts, _)| within_window(*ts, now, Duration::seconds(1)))
            .fold((0, 0), |(count, bytes), (_, b)| (count + 1, bytes + b))
    }

    fn record(
        &mut self,
        now: DateTime<Utc>,
        bytes: u64,
        settings: &LimiterSettings,
    ) -> Result<(), (ViolationType, String, Duration)> {
        let block_duration = Duration::seconds(settings.block_duration_secs);
        self.events.push_back((now, bytes));
        self.last_activity = self.last_activity.max(now);
        self.prune(now);

        if let Some(remaining) = self.remaining_block(now, block_duration) {
            return Err((
                self.block_reason,
                format!("blocked for another {}s", remaining.num_seconds()),
                remaining,
            ));
        }
        self.blocked_at = None;

        let (per_second, bytes_per_second) = self.second_totals(now);
        let per_minute = self.events.len() as u64;

        let violation = if per_second > u64::from(settings.max_per_second) {
            Some((
                ViolationType::ConnectionRate,
                format!("{} connections in 1s exceeds {}", per_second, settings.max_per_second),
            ))
        } else if per_minute > u64::from(settings.max_per_minute) {
            Some((
                ViolationType::ConnectionsPerMinute,
                format!("{} connections in 1m exceeds {}", per_minute, settings.max_per_minute),
            ))
        } else {
            settings
                .max_bytes_per_second
                .filter(|max| bytes_per_second > *max)
                .map(|max| {
                    (
                        ViolationType::Bandwidth,
                        format!("{} bytes in 1s exceeds {}", bytes_per_second, max),
                    )
                })
        };

        match violation {
            Some((violation_type, detail)) => {
                self.blocked_at = Some(now);
                self.block_reason = violation_type;
                Err((violation_type, detail, block_duration))
            }
            None => Ok(()),
        }
    }
}

/// One family of limiters sharing the same settings
#[derive(Debug)]
struct LimiterFamily<K: Eq + Hash> {
    scope: LimitScope,
    settings: LimiterSettings,
    limiters: DashMap<K, Arc<Mutex<SlidingWindowLimiter>>>,
}

impl<K> LimiterFamily<K>
where
    K: Eq + Hash + Copy + fmt::Display,
{
    fn new(scope: LimitScope, settings: LimiterSettings) -> Self {
        Self {
            scope,
            settings,
            limiters: DashMap::new(),
        }
    }

    fn block_duration(&self) -> Duration {
        Duration::seconds(self.settings.block_duration_secs)
    }

    fn check(&self, key: K, now: DateTime<Utc>, bytes: u64) -> Option<RateLimitViolation> {
        let limiter = self
            .limiters
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(SlidingWindowLimiter::new(now))))
            .clone();
        let mut limiter = limiter.lock();
        let was_blocked = limiter.remaining_block(now, self.block_duration()).is_some();

        match limiter.record(now, bytes, &self.settings) {
            Ok(()) => None,
            Err((violation_type, detail, remaining)) => {
                if !was_blocked {
                    warn!("Rate limit: blocking {} {} ({})", self.scope, key, detail);
                }
                Some(RateLimitViolation {
                    violation_type,
                    scope: self.scope,
                    identity: key.to_string(),
                    detail,
                    occurred_at: now,
                    remaining_block_secs: remaining.num_seconds(),
                })
            }
        }
    }

    fn is_blocked(&self, key: K, now: DateTime<Utc>) -> bool {
        self.limiters
            .get(&key)
            .map(|limiter| limiter.lock().remaining_block(now, self.block_duration()).is_some())
            .unwrap_or(false)
    }

    fn unblock(&self, key: K) -> bool {
        match self.limiters.get(&key) {
            Some(limiter) => {
                let mut limiter = limiter.lock();
                let was_blocked = limiter.blocked_at.take().is_some();
                // Forget the burst so the next attempt starts from a clean window.
                limiter.events.clear();
                if was_blocked {
                    info!("Rate limit: {} {} manually unblocked", self.scope, key);
                }
                was_blocked
            }
            None => false,
        }
    }

    fn blocked(&self, now: DateTime<Utc>) -> Vec<BlockedEntry> {
        let duration = self.block_duration();
        self.limiters
            .iter()
            .filter_map(|entry| {
                let limiter = entry.value().lock();
                let remaining = limiter.remaining_block(now, duration)?;
                Some(BlockedEntry {
                    scope: self.scope,
                    identity: entry.key().to_string(),
                    reason: limiter.block_reason,
                    blocked_at: limiter.blocked_at?,
                    remaining_secs: remaining.num_seconds(),
                })
            })
            .collect()
    }

    fn cleanup_idle(&self, now: DateTime<Utc>, idle: Duration) -> usize {
        let before = self.limiters.len();
        let duration = self.block_duration();
        self.limiters.retain(|_, limiter| {
            let limiter = limiter.lock();
            now - limiter.last_activity <= idle || limiter.remaining_block(now, duration).is_some()
        });
        before - self.limiters.len()
    }

    fn len(&self) -> usize {
        self.limiters.len()
    }
}

/// Rate limiter service covering the IP, port and process families
#[derive(Debug)]
pub struct RateLimitingService {
    ip: LimiterFamily<IpAddr>,
    port: LimiterFamily<u16>,
    process: LimiterFamily<u32>,
    idle_timeout: Duration,
    cleanup_interval: std::time::Duration,
}

impl RateLimitingService {
    /// Create a new rate limiting service
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        config.validate()?;
        Ok(Self {
            ip: LimiterFamily::new(LimitScope::Ip, config.ip),
            port: LimiterFamily::new(LimitScope::Port, config.port),
            process: LimiterFamily::new(LimitScope::Process, config.process),
            idle_timeout: Duration::seconds(config.idle_timeout_secs),
            cleanup_interval: std::time::Duration::from_secs(config.cleanup_interval_secs.max(1)),
        })
    }

    /// Records the attempt against every family it has a key for.
    /// Bytes are only limited per IP.
    pub fn check_limit(&self, attempt: &ConnectionAttempt) -> RateLimitDecision {
        let now = attempt.timestamp;
        let violations = [
            self.ip.check(attempt.remote_ip, now, attempt.bytes),
            attempt.local_port.and_then(|port| self.port.check(port, now, 0)),
            attempt.process_id.and_then(|pid| self.process.check(pid, now, 0)),
        ];
        RateLimitDecision {
            violations: violations.into_iter().flatten().collect(),
        }
    }

    pub fn is_ip_blocked(&self, ip: IpAddr, now: DateTime<Utc>) -> bool {
        self.ip.is_blocked(ip, now)
    }

    pub fn is_port_blocked(&self, port: u16, now: DateTime<Utc>) -> bool {
        self.port.is_blocked(port, now)
    }

    pub fn is_process_blocked(&self, process_id: u32, now: DateTime<Utc>) -> bool {
        self.process.is_blocked(process_id, now)
    }

    pub fn unblock_ip(&self, ip: IpAddr) -> bool {
        self.ip.unblock(ip)
    }

    pub fn unblock_port(&self, port: u16) -> bool {
        self.port.unblock(port)
    }

    pub fn unblock_process(&self, process_id: u32) -> bool {
        self.process.unblock(process_id)
    }

    /// Every key currently blocked, across all families
    pub fn blocked(&self, now: DateTime<Utc>) -> Vec<BlockedEntry> {
        let mut blocked = self.ip.blocked(now);
        blocked.extend(self.port.blocked(now));
        blocked.extend(self.process.blocked(now));
        blocked
    }

    pub fn blocked_ips(&self, now: DateTime<Utc>) -> Vec<BlockedEntry> {
        self.ip.blocked(now)
    }

    /// Drops limiters idle past the configured horizon. Blocked limiters are kept.
    pub fn cleanup_idle(&self, now: DateTime<Utc>) -> usize {
        let removed = self.ip.cleanup_idle(now, self.idle_timeout)
            + self.port.cleanup_idle(now, self.idle_timeout)
            + self.process.cleanup_idle(now, self.idle_timeout);
        if removed > 0 {
            info!("Rate limit sweep removed {} idle limiters", removed);
        }
        removed
    }

    pub fn tracked_limiters(&self) -> usize {
        self.ip.len() + self.port.len() + self.process.len()
    }

    /// Runs the idle sweep on its own timer until `shutdown` flips to `true`.
    pub fn spawn_cleanup_task(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.cleanup_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.cleanup_idle(Utc::now());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Rate limit sweep stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn at(ms: i64, source: IpAddr) -> ConnectionAttempt {
        ConnectionAttempt::new(base() + Duration::milliseconds(ms), source)
    }

    fn service() -> RateLimitingService {
        RateLimitingService::new(RateLimitConfig::default()).unwrap()
    }

    #[test]
    fn eleventh_attempt_in_one_second_is_rejected() {
        let limiter = service();
        let source = ip("198.51.100.4");
        for i in 0..10 {
            let attempt = ConnectionAttempt::new(base() + Duration::milliseconds(i * 50), source);
            assert!(limiter.check_limit(&attempt).is_allowed(), "attempt {} should pass", i + 1);
        }

        let eleventh = limiter.check_limit(&at(600, source));
        assert_eq!(eleventh.violations.len(), 1);
        assert_eq!(eleventh.violations[0].violation_type, ViolationType::ConnectionRate);
        assert_eq!(eleventh.violations[0].scope, LimitScope::Ip);
        assert_eq!(eleventh.violations[0].identity, "198.51.100.4");

        let twelfth = limiter.check_limit(&at(650, source));
        assert!(!twelfth.is_allowed());
        assert_eq!(twelfth.violations[0].violation_type, ViolationType::ConnectionRate);
        assert!(twelfth.violations[0].remaining_block_secs > 290);

        assert!(limiter.is_ip_blocked(source, base() + Duration::seconds(1)));
        assert!(limiter.is_ip_blocked(source, base() + Duration::seconds(299)));
        assert!(!limiter.is_ip_blocked(source, base() + Duration::seconds(301)));

        let later = ConnectionAttempt::new(base() + Duration::seconds(301), source);
        assert!(limiter.check_limit(&later).is_allowed());
    }

    #[test]
    fn per_minute_limit_blocks_slow_steady_sources() {
        let limiter = service();
        let source = ip("203.0.113.20");
        // 5 per second stays under 10/s but crosses 100/min after 20 seconds.
        let mut rejected_at = None;
        for i in 0..150 {
            let attempt = ConnectionAttempt::new(base() + Duration::milliseconds(i * 200), source);
            let decision = limiter.check_limit(&attempt);
            if !decision.is_allowed() {
                assert_eq!(
                    decision.violations[0].violation_type,
                    ViolationType::ConnectionsPerMinute
                );
                rejected_at = Some(i);
                break;
            }
        }
        assert_eq!(rejected_at, Some(100));
    }

    #[test]
    fn bandwidth_limit_applies_to_ip_only() {
        let limiter = service();
        let attempt = ConnectionAttempt::new(base(), ip("203.0.113.30"))
            .with_port(443)
            .with_bytes(6 * 1024 * 1024);
        let decision = limiter.check_limit(&attempt);
        assert_eq!(decision.violations.len(), 1);
        assert_eq!(decision.violations[0].violation_type, ViolationType::Bandwidth);
        assert!(!limiter.is_port_blocked(443, base()));
    }

    #[test]
    fn port_and_process_families_are_independent() {
        let limiter = service();
        for i in 0..101 {
            let source = IpAddr::from([203, 0, 113, (i % 250) as u8]);
            let attempt = ConnectionAttempt::new(base() + Duration::milliseconds(i), source)
                .with_port(8080)
                .with_process(4242);
            limiter.check_limit(&attempt);
        }
        assert!(limiter.is_port_blocked(8080, base() + Duration::seconds(1)));
        assert!(limiter.is_process_blocked(4242, base() + Duration::seconds(1)));
        assert!(!limiter.is_port_blocked(8080, base() + Duration::seconds(61)));
        assert!(limiter.is_process_blocked(4242, base() + Duration::seconds(61)));
        assert_eq!(limiter.blocked(base() + Duration::seconds(1)).len(), 2);
    }

    #[test]
    fn manual_unblock_clears_immediately() {
        let limiter = service();
        let source = ip("198.51.100.9");
        for i in 0..11 {
            limiter.check_limit(&at(i, source));
        }
        assert_eq!(limiter.blocked_ips(base()).len(), 1);
        assert!(limiter.unblock_ip(source));
        assert!(!limiter.is_ip_blocked(source, base()));
        assert!(limiter.check_limit(&at(20, source)).is_allowed());
        assert!(!limiter.unblock_ip(ip("192.0.2.1")));
    }

    #[test]
    fn idle_limiters_are_swept_but_blocked_ones_kept() {
        let limiter = service();
        limiter.check_limit(&ConnectionAttempt::new(base(), ip("192.0.2.10")));
        let process = 7;
        for i in 0..51 {
            limiter.check_limit(&at(500_000 + i, ip("192.0.2.11")).with_process(process));
        }
        assert_eq!(limiter.tracked_limiters(), 3);

        let removed = limiter.cleanup_idle(base() + Duration::seconds(601));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_limiters(), 2);
    }

    #[test]
    fn attempts_at_the_edges_of_time_do_not_panic() {
        let limiter = service();
        let source = ip("192.0.2.30");
        for edge in [DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC] {
            for _ in 0..12 {
                limiter.check_limit(&ConnectionAttempt::new(edge, source).with_port(80));
            }
            limiter.is_ip_blocked(source, edge);
            limiter.blocked(edge);
            limiter.cleanup_idle(edge);
        }
    }

    #[test]
    fn service_is_debuggable() {
        let limiter = service();
        limiter.check_limit(&ConnectionAttempt::new(base(), ip("192.0.2.31")));
        let rendered = format!("{:?}", limiter);
        assert!(rendered.contains("RateLimitingService"));
        assert!(rendered.contains("LimiterFamily"));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut config = RateLimitConfig::default();
        config.port.block_duration_secs = 0;
        assert!(matches!(
            RateLimitingService::new(config),
            Err(RateLimitError::InvalidLimit { scope: LimitScope::Port, .. })
        ));
    }

    #[tokio::test]
    async fn cleanup_task_stops_on_shutdown() {
        let limiter = Arc::new(service());
        let (tx, rx) = watch::channel(false);
        let handle = limiter.clone().spawn_cleanup_task(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("sweep should stop")
            .unwrap();
    }
}
