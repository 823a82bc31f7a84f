//! Fixed-size running aggregates, one per metric category.
//!
//! Every latency/size/resource figure in the pipeline lands in a
//! [`RunningStats`] owned by the component that measures it. Nothing is
//! retained per sample, so long sessions cost constant memory.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Everything the pipeline knows how to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    /// Sender: time between consecutive chunks (ms), first chunk excluded
    ChunkDuration,
    /// Sender: encoded chunk size (bytes)
    ChunkSize,
    /// Sender: RTT / 2 from per-chunk acks (ms)
    OneWayLatency,
    /// Relay: deviation from the session's ideal arrival schedule (ms)
    ServerDelay,
    /// Relay: sender→relay transit drift after clock reconciliation (ms)
    UplinkTransit,
    /// Receiver: deviation from the playback schedule (ms)
    NetworkDelay,
    /// Receiver: sender→receiver transit drift after clock reconciliation (ms)
    EndToEndTransit,
    /// Receiver: gap between consecutive arrivals (ms)
    ArrivalInterval,
    /// Receiver: append submission → rendered frame (ms)
    DecodeToDisplay,
    /// Receiver: chunks waiting behind the in-flight append
    QueueDepth,
    /// Any process: CPU usage of this process (%)
    CpuPercent,
    /// Any process: resident memory (MB)
    MemoryMb,
    /// Any process: GPU usage (%), only when a sampler provides it
    GpuPercent,
}

impl MetricCategory {
    pub const ALL: [MetricCategory; 13] = [
        MetricCategory::ChunkDuration,
        MetricCategory::ChunkSize,
        MetricCategory::OneWayLatency,
        MetricCategory::ServerDelay,
        MetricCategory::UplinkTransit,
        MetricCategory::NetworkDelay,
        MetricCategory::EndToEndTransit,
        MetricCategory::ArrivalInterval,
        MetricCategory::DecodeToDisplay,
        MetricCategory::QueueDepth,
        MetricCategory::CpuPercent,
        MetricCategory::MemoryMb,
        MetricCategory::GpuPercent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricCategory::ChunkDuration => "chunk_duration",
            MetricCategory::ChunkSize => "chunk_size",
            MetricCategory::OneWayLatency => "one_way_latency",
            MetricCategory::ServerDelay => "server_delay",
            MetricCategory::UplinkTransit => "uplink_transit",
            MetricCategory::NetworkDelay => "network_delay",
            MetricCategory::EndToEndTransit => "end_to_end_transit",
            MetricCategory::ArrivalInterval => "arrival_interval",
            MetricCategory::DecodeToDisplay => "decode_to_display",
            MetricCategory::QueueDepth => "queue_depth",
            MetricCategory::CpuPercent => "cpu_percent",
            MetricCategory::MemoryMb => "memory_mb",
            MetricCategory::GpuPercent => "gpu_percent",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            MetricCategory::ChunkSize => "B",
            MetricCategory::QueueDepth => "chunks",
            MetricCategory::CpuPercent | MetricCategory::GpuPercent => "%",
            MetricCategory::MemoryMb => "MB",
            _ => "ms",
        }
    }
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count / sum / sum-of-squares / min / max over a stream of samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one sample in. Non-finite samples are ignored so a bad clock
    /// reading can never poison the aggregate with NaN.
    pub fn update(&mut self, sample: f64) {
        if !sample.is_finite() {
            return;
        }
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.count += 1;
        self.sum += sample;
        self.sum_sq += sample * sample;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    #[cfg(test)]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Population standard deviation.
    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = (self.sum_sq / self.count as f64 - mean * mean).max(0.0);
        Some(variance.sqrt())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            count: self.count,
            avg: self.mean(),
            min: self.min(),
            max: self.max(),
            std_dev: self.std_dev(),
        }
    }
}

/// Immutable view of a [`RunningStats`]. `None` means "unavailable",
/// never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub count: u64,
    #[serde(default)]
    pub avg: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub std_dev: Option<f64>,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt(v: Option<f64>) -> String {
            v.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "n/a".to_string())
        }
        write!(
            f,
            "n={} avg {} | min {} | max {}",
            self.count,
            opt(self.avg),
            opt(self.min),
            opt(self.max)
        )
    }
}

/// Snapshot of every recorded category at one instant.
pub type MetricsSnapshot = BTreeMap<MetricCategory, StatsSnapshot>;

/// Which categories a process records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricSet(BTreeSet<MetricCategory>);

impl MetricSet {
    pub fn all() -> Self {
        Self(MetricCategory::ALL.into_iter().collect())
    }

    #[cfg(test)]
    pub fn only<I: IntoIterator<Item = MetricCategory>>(categories: I) -> Self {
        Self(categories.into_iter().collect())
    }

    pub fn contains(&self, category: MetricCategory) -> bool {
        self.0.contains(&category)
    }
}

impl Default for MetricSet {
    fn default() -> Self {
        Self::all()
    }
}

/// The aggregates owned by one component.
#[derive(Debug, Clone)]
pub struct MetricBook {
    enabled: MetricSet,
    stats: BTreeMap<MetricCategory, RunningStats>,
    frozen: bool,
}

impl MetricBook {
    pub fn new(enabled: MetricSet) -> Self {
        Self {
            enabled,
            stats: BTreeMap::new(),
            frozen: false,
        }
    }

    /// Record a sample. Disabled categories and frozen books drop it.
    pub fn record(&mut self, category: MetricCategory, sample: f64) {
        if self.frozen || !self.enabled.contains(category) {
            return;
        }
        self.stats.entry(category).or_default().update(sample);
    }

    pub fn get(&self, category: MetricCategory) -> Option<&RunningStats> {
        self.stats.get(&category)
    }

    pub fn count(&self, category: MetricCategory) -> u64 {
        self.get(category).map(RunningStats::count).unwrap_or(0)
    }

    /// Stop accepting samples. Used once a session reaches its terminal state.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.stats
            .iter()
            .map(|(category, stats)| (*category, stats.snapshot()))
            .collect()
    }
}

impl Default for MetricBook {
    fn default() -> Self {
        Self::new(MetricSet::all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats_are_unavailable() {
        let stats = RunningStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap.count, 0);
        assert_eq!(snap.avg, None);
        assert_eq!(snap.min, None);
        assert_eq!(snap.max, None);
        assert_eq!(snap.std_dev, None);
    }

    #[test]
    fn test_running_aggregate() {
        let mut stats = RunningStats::new();
        for s in [1000.0, 2000.0, 1500.0] {
            stats.update(s);
        }
        assert_eq!(stats.count(), 3);
        assert_eq!(stats.mean(), Some(1500.0));
        assert_eq!(stats.min(), Some(1000.0));
        assert_eq!(stats.max(), Some(2000.0));
        let sd = stats.std_dev().unwrap();
        assert!((sd - 408.248).abs() < 0.01);
    }

    #[test]
    fn test_negative_samples_track_min() {
        let mut stats = RunningStats::new();
        stats.update(-5.0);
        stats.update(3.0);
        assert_eq!(stats.min(), Some(-5.0));
        assert_eq!(stats.max(), Some(3.0));
    }

    #[test]
    fn test_non_finite_samples_ignored() {
        let mut stats = RunningStats::new();
        stats.update(f64::NAN);
        stats.update(f64::INFINITY);
        assert_eq!(stats.count(), 0);
        stats.update(4.0);
        assert_eq!(stats.mean(), Some(4.0));
    }

    #[test]
    fn test_book_respects_enabled_set() {
        let mut book = MetricBook::new(MetricSet::only([MetricCategory::ChunkSize]));
        book.record(MetricCategory::ChunkSize, 10.0);
        book.record(MetricCategory::NetworkDelay, 10.0);
        let snap = book.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap.contains_key(&MetricCategory::ChunkSize));
    }

    #[test]
    fn test_frozen_book_ignores_samples() {
        let mut book = MetricBook::default();
        book.record(MetricCategory::NetworkDelay, 1.0);
        book.freeze();
        book.record(MetricCategory::NetworkDelay, 100.0);
        assert_eq!(book.count(MetricCategory::NetworkDelay), 1);
        assert_eq!(
            book.get(MetricCategory::NetworkDelay).and_then(RunningStats::max),
            Some(1.0)
        );
    }

    #[test]
    fn test_metric_set_from_toml_list() {
        #[derive(Deserialize)]
        struct Wrapper {
            metrics: MetricSet,
        }
        let w: Wrapper = toml::from_str(r#"metrics = ["network_delay", "queue_depth"]"#).unwrap();
        assert!(w.metrics.contains(MetricCategory::NetworkDelay));
        assert!(w.metrics.contains(MetricCategory::QueueDepth));
        assert!(!w.metrics.contains(MetricCategory::ChunkSize));
    }
}
