//! Defense statistics.
//!
//! Counters are kept as atomics for the `/stats` snapshot and mirrored to the
//! `metrics` facade, so a Prometheus exporter sees the same numbers.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, increment_counter};
use serde::{Deserialize, Serialize};

/// Serializable view of [`DefenseStatistics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub packets_processed: u64,
    pub bytes_processed: u64,
    pub alerts_raised: u64,
    pub advanced_alerts_raised: u64,
    pub rate_limit_violations: u64,
    pub block_decisions: u64,
    pub blocks_applied: u64,
    pub blocks_failed: u64,
    pub persistence_failures: u64,
    pub analysis_errors: u64,
    pub cycles_completed: u64,
    pub queued_packets: u64,
    pub tracked_flows: u64,
    pub tracked_sources: u64,
    pub started_at: DateTime<Utc>,
}

/// Running counters for the defense pipeline
#[derive(Debug)]
pub struct DefenseStatistics {
    packets_processed: AtomicU64,
    bytes_processed: AtomicU64,
    alerts_raised: AtomicU64,
    advanced_alerts_raised: AtomicU64,
    rate_limit_violations: AtomicU64,
    block_decisions: AtomicU64,
    blocks_applied: AtomicU64,
    blocks_failed: AtomicU64,
    persistence_failures: AtomicU64,
    analysis_errors: AtomicU64,
    cycles_completed: AtomicU64,
    queued_packets: AtomicU64,
    tracked_flows: AtomicU64,
    tracked_sources: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Default for DefenseStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl DefenseStatistics {
    pub fn new() -> Self {
        Self {
            packets_processed: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
            advanced_alerts_raised: AtomicU64::new(0),
            rate_limit_violations: AtomicU64::new(0),
            block_decisions: AtomicU64::new(0),
            blocks_applied: AtomicU64::new(0),
            blocks_failed: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            analysis_errors: AtomicU64::new(0),
            cycles_completed: AtomicU64::new(0),
            queued_packets: AtomicU64::new(0),
            tracked_flows: AtomicU64::new(0),
            tracked_sources: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_packets(&self, packets: u64, bytes: u64) {
        self.packets_processed.fetch_add(packets, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
        counter!("defense_packets_processed_total", packets);
        counter!("defense_bytes_processed_total", bytes);
    }

    pub fn record_alert(&self) {
        self.alerts_raised.fetch_add(1, Ordering::Relaxed);
        increment_counter!("defense_alerts_total");
    }

    pub fn record_advanced_alert(&self) {
        self.advanced_alerts_raised.fetch_add(1, Ordering::Relaxed);
        increment_counter!("defense_advanced_alerts_total");
    }

    pub fn record_violation(&self) {
        self.rate_limit_violations.fetch_add(1, Ordering::Relaxed);
        increment_counter!("defense_rate_limit_violations_total");
    }

    pub fn record_decision(&self) {
        self.block_decisions.fetch_add(1, Ordering::Relaxed);
        increment_counter!("defense_block_decisions_total");
    }

    pub fn record_block(&self, success: bool) {
        if success {
            self.blocks_applied.fetch_add(1, Ordering::Relaxed);
            increment_counter!("defense_blocks_applied_total");
        } else {
            self.blocks_failed.fetch_add(1, Ordering::Relaxed);
            increment_counter!("defense_blocks_failed_total");
        }
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        increment_counter!("defense_persistence_failures_total");
    }

    pub fn record_analysis_error(&self) {
        self.analysis_errors.fetch_add(1, Ordering::Relaxed);
        increment_counter!("defense_analysis_errors_total");
    }

    pub fn record_cycle(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        increment_counter!("defense_cycles_total");
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queued_packets.store(depth as u64, Ordering::Relaxed);
        gauge!("defense_queue_depth", depth as f64);
    }

    pub fn set_tracked(&self, flows: usize, sources: usize) {
        self.tracked_flows.store(flows as u64, Ordering::Relaxed);
        self.tracked_sources.store(sources as u64, Ordering::Relaxed);
        gauge!("defense_tracked_flows", flows as f64);
        gauge!("defense_tracked_sources", sources as f64);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            advanced_alerts_raised: self.advanced_alerts_raised.load(Ordering::Relaxed),
            rate_limit_violations: self.rate_limit_violations.load(Ordering::Relaxed),
            block_decisions: self.block_decisions.load(Ordering::Relaxed),
            blocks_applied: self.blocks_applied.load(Ordering::Relaxed),
            blocks_failed: self.blocks_failed.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            analysis_errors: self.analysis_errors.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            queued_packets: self.queued_packets.load(Ordering::Relaxed),
            tracked_flows: self.tracked_flows.load(Ordering::Relaxed),
            tracked_sources: self.tracked_sources.load(Ordering::Relaxed),
            started_at: self.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let stats = DefenseStatistics::new();
        stats.record_packets(10, 6400);
        stats.record_alert();
        stats.record_block(true);
        stats.record_block(false);
        stats.set_queue_depth(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.packets_processed, 10);
        assert_eq!(snapshot.bytes_processed, 6400);
        assert_eq!(snapshot.alerts_raised, 1);
        assert_eq!(snapshot.blocks_applied, 1);
        assert_eq!(snapshot.blocks_failed, 1);
        assert_eq!(snapshot.queued_packets, 3);
    }
}
