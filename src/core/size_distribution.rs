//! Per-source packet size statistics and size-based anomaly classification.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::packet::Protocol;
use crate::utils::mean_and_std_dev;

const SAMPLE_RETENTION_SECS: i64 = 300;
const MIN_SAMPLES: usize = 10;

const UNIFORM_MAX_STD_DEV: f64 = 10.0;
const UNIFORM_MIN_COUNT: usize = 50;
const LARGE_PACKET_BYTES: u32 = 9000;
const SMALL_MEAN_BYTES: f64 = 50.0;
const SMALL_MIN_COUNT: usize = 100;

/// Size anomaly classification, one per source per detection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeAnomalyKind {
    /// Near-constant sizes over many packets, typical of scripted bots
    UniformSize,
    /// At least one packet larger than a jumbo frame
    ExcessivelyLarge,
    /// Many tiny packets, typical of floods
    ExcessivelySmall,
}

impl fmt::Display for SizeAnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeAnomalyKind::UniformSize => f.write_str("uniform packet size"),
            SizeAnomalyKind::ExcessivelyLarge => f.write_str("excessively large packets"),
            SizeAnomalyKind::ExcessivelySmall => f.write_str("excessively small packets"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeAnomaly {
    pub source_ip: IpAddr,
    pub kind: SizeAnomalyKind,
    pub sample_count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: u32,
    pub max: u32,
    pub dominant_protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeBucket {
    pub label: String,
    pub count: u64,
}

/// Global size statistics across every tracked source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeDistributionStats {
    pub total_samples: usize,
    pub mean: f64,
    pub min: u32,
    pub max: u32,
    pub std_dev: f64,
    pub buckets: Vec<SizeBucket>,
}

const BUCKET_LABELS: [&str; 5] = ["0-100", "101-500", "501-1000", "1001-1500", "1500+"];

fn bucket_index(size: u32) -> usize {
    match size {
        0..=100 => 0,
        101..=500 => 1,
        501..=1000 => 2,
        1001..=1500 => 3,
        _ => 4,
    }
}

#[derive(Debug, Clone, Copy)]
struct SizeSample {
    timestamp: DateTime<Utc>,
    size: u32,
    protocol: Protocol,
}

#[derive(Debug, Default)]
struct SourceSamples {
    samples: VecDeque<SizeSample>,
}

impl SourceSamples {
    fn prune(&mut self, now: DateTime<Utc>) {
        let Some(cutoff) = now.checked_sub_signed(Duration::seconds(SAMPLE_RETENTION_SECS)) else {
            return;
        };
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn classify(&self, source_ip: IpAddr) -> Option<SizeAnomaly> {
        let count = self.samples.len();
        if count < MIN_SAMPLES {
            return None;
        }
        let (mean, std_dev) = mean_and_std_dev(self.samples.iter().map(|s| f64::from(s.size)));
        let min = self.samples.iter().map(|s| s.size).min().unwrap_or(0);
        let max = self.samples.iter().map(|s| s.size).max().unwrap_or(0);

        let kind = if std_dev < UNIFORM_MAX_STD_DEV && count > UNIFORM_MIN_COUNT {
            SizeAnomalyKind::UniformSize
        } else if max > LARGE_PACKET_BYTES {
            SizeAnomalyKind::ExcessivelyLarge
        } else if mean < SMALL_MEAN_BYTES && count > SMALL_MIN_COUNT {
            SizeAnomalyKind::ExcessivelySmall
        } else {
            return None;
        };

        Some(SizeAnomaly {
            source_ip,
            kind,
            sample_count: count,
            mean,
            std_dev,
            min,
            max,
            dominant_protocol: self.dominant_protocol(),
        })
    }

    fn dominant_protocol(&self) -> Protocol {
        let mut counts: HashMap<Protocol, usize> = HashMap::new();
        for sample in &self.samples {
            *counts.entry(sample.protocol).or_default() += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(protocol, _)| protocol)
            .unwrap_or(Protocol::Other)
    }
}

/// Tracks timestamped size samples per source IP
#[derive(Debug, Default)]
pub struct PacketSizeDistributionAnalyzer {
    sources: DashMap<IpAddr, Arc<Mutex<SourceSamples>>>,
}

impl PacketSizeDistributionAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_packet(
        &self,
        source_ip: IpAddr,
        size: u32,
        protocol: Protocol,
        timestamp: DateTime<Utc>,
    ) {
        let entry = self
            .sources
            .entry(source_ip)
            .or_insert_with(|| Arc::new(Mutex::new(SourceSamples::default())))
            .clone();
        let mut samples = entry.lock();
        samples.samples.push_back(SizeSample {
            timestamp,
            size,
            protocol,
        });
        samples.prune(timestamp);
    }

    /// Classifies every source holding at least ten samples.
    /// Rules are tried in order and the first match wins.
    pub fn detect_anomalies(&self, now: DateTime<Utc>) -> Vec<SizeAnomaly> {
        let mut anomalies = Vec::new();
        for entry in self.sources.iter() {
            let mut samples = entry.value().lock();
            samples.prune(now);
            if let Some(anomaly) = samples.classify(*entry.key()) {
                anomalies.push(anomaly);
            }
        }
        anomalies
    }

    pub fn distribution_statistics(&self) -> SizeDistributionStats {
        let mut sizes = Vec::new();
        for entry in self.sources.iter() {
            let samples = entry.value().lock();
            sizes.extend(samples.samples.iter().map(|s| s.size));
        }

        let mut counts = [0u64; 5];
        for size in &sizes {
            counts[bucket_index(*size)] += 1;
        }
        let (mean, std_dev) = mean_and_std_dev(sizes.iter().map(|s| f64::from(*s)));

        SizeDistributionStats {
            total_samples: sizes.len(),
            mean,
            min: sizes.iter().copied().min().unwrap_or(0),
            max: sizes.iter().copied().max().unwrap_or(0),
            std_dev,
            buckets: BUCKET_LABELS
                .iter()
                .zip(counts)
                .map(|(label, count)| SizeBucket {
                    label: label.to_string(),
                    count,
                })
                .collect(),
        }
    }

    /// Drops sources with no sample newer than the retention horizon.
    pub fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let before = self.sources.len();
        self.sources.retain(|_, samples| {
            let mut samples = samples.lock();
            samples.prune(now);
            !samples.samples.is_empty()
        });
        before - self.sources.len()
    }

    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }
}
