//! Fixed elapsed-time checkpoints and the report that travels with them.
//!
//! The sender owns the schedule and submits its partial report at each mark;
//! the relay folds in its own aggregates and rebroadcasts; each receiver
//! folds in its local aggregates before logging and persisting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::clock::Millis;
use crate::stats::{MetricBook, MetricsSnapshot};

/// 1 minute, 5 minutes, 30 minutes.
pub const DEFAULT_MARKS_MS: [u64; 3] = [60_000, 300_000, 1_800_000];

/// One party's contribution to a milestone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartyStats {
    pub chunk_count: u64,
    #[serde(default)]
    pub metrics: MetricsSnapshot,
}

impl PartyStats {
    pub fn from_book(chunk_count: u64, book: &MetricBook) -> Self {
        Self {
            chunk_count,
            metrics: book.snapshot(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneReport {
    /// Elapsed milliseconds since session start this report belongs to
    pub mark_ms: u64,
    /// Sender wall clock when the mark fired
    #[serde(default)]
    pub sender_time: Option<Millis>,
    /// Relay wall clock when it rebroadcast the report
    #[serde(default)]
    pub relay_time: Option<Millis>,
    /// Receiver wall clock when it merged the report
    #[serde(default)]
    pub receiver_time: Option<Millis>,
    #[serde(default)]
    pub sender: Option<PartyStats>,
    #[serde(default)]
    pub relay: Option<PartyStats>,
    #[serde(default)]
    pub receiver: Option<PartyStats>,
}

impl MilestoneReport {
    pub fn from_sender(mark_ms: u64, sender_time: Millis, stats: PartyStats) -> Self {
        Self {
            mark_ms,
            sender_time: Some(sender_time),
            relay_time: None,
            receiver_time: None,
            sender: Some(stats),
            relay: None,
            receiver: None,
        }
    }

    pub fn merge_relay(mut self, relay_time: Millis, stats: PartyStats) -> Self {
        self.relay_time = Some(relay_time);
        self.relay = Some(stats);
        self
    }

    pub fn merge_receiver(mut self, receiver_time: Millis, stats: PartyStats) -> Self {
        self.receiver_time = Some(receiver_time);
        self.receiver = Some(stats);
        self
    }

    /// Receiver wall clock minus sender wall clock. Only meaningful when
    /// both machines keep their wall clocks in sync.
    pub fn sender_to_receiver_wall_delta(&self) -> Option<Millis> {
        Some(self.receiver_time? - self.sender_time?)
    }

    pub fn label(&self) -> String {
        mark_label(self.mark_ms)
    }
}

pub fn mark_label(mark_ms: u64) -> String {
    if mark_ms % 60_000 == 0 {
        format!("{} min", mark_ms / 60_000)
    } else {
        format!("{:.1} s", mark_ms as f64 / 1000.0)
    }
}

/// Tracks which marks of a session have fired.
#[derive(Debug, Clone)]
pub struct MilestoneSchedule {
    marks: Vec<u64>,
    fired: BTreeSet<u64>,
}

impl MilestoneSchedule {
    pub fn new<I: IntoIterator<Item = u64>>(marks: I) -> Self {
        let mut marks: Vec<u64> = marks.into_iter().collect();
        marks.sort_unstable();
        marks.dedup();
        Self {
            marks,
            fired: BTreeSet::new(),
        }
    }

    pub fn marks(&self) -> &[u64] {
        &self.marks
    }

    /// Marks that are due at `elapsed_ms` and have not fired yet, ascending.
    /// Each returned mark is recorded as fired.
    pub fn due(&mut self, elapsed_ms: Millis) -> Vec<u64> {
        let due: Vec<u64> = self
            .marks
            .iter()
            .copied()
            .filter(|m| (*m as f64) <= elapsed_ms && !self.fired.contains(m))
            .collect();
        self.fired.extend(due.iter().copied());
        due
    }

    /// Record a mark triggered elsewhere (a relayed report). Returns false
    /// for a mark this session has already seen.
    pub fn claim(&mut self, mark_ms: u64) -> bool {
        self.fired.insert(mark_ms)
    }

    /// The next mark that has not fired.
    pub fn next_pending(&self) -> Option<u64> {
        self.marks
            .iter()
            .copied()
            .find(|m| !self.fired.contains(m))
    }

    pub fn is_complete(&self) -> bool {
        self.next_pending().is_none()
    }

    /// Forget fired marks; the next session starts over.
    pub fn reset(&mut self) {
        self.fired.clear();
    }
}

impl Default for MilestoneSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_MARKS_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::MetricCategory;

    #[test]
    fn test_each_mark_fires_once() {
        let mut schedule = MilestoneSchedule::default();
        assert!(schedule.due(59_999.0).is_empty());
        assert_eq!(schedule.due(60_000.0), vec![60_000]);
        // A burst of chunk events right around the mark
        for t in [60_000.0, 60_001.0, 60_050.0, 60_150.0] {
            assert!(schedule.due(t).is_empty());
        }
        assert_eq!(schedule.due(2_000_000.0), vec![300_000, 1_800_000]);
        assert!(schedule.is_complete());
        assert!(schedule.due(3_000_000.0).is_empty());
    }

    #[test]
    fn test_claim_deduplicates() {
        let mut schedule = MilestoneSchedule::default();
        assert!(schedule.claim(60_000));
        assert!(!schedule.claim(60_000));
        assert_eq!(schedule.next_pending(), Some(300_000));
        schedule.reset();
        assert!(schedule.claim(60_000));
    }

    #[test]
    fn test_marks_sorted_and_unique() {
        let schedule = MilestoneSchedule::new([300_000, 60_000, 60_000]);
        assert_eq!(schedule.marks(), &[60_000, 300_000]);
    }

    #[test]
    fn test_report_merge_keeps_each_party() {
        let mut book = MetricBook::default();
        book.record(MetricCategory::ChunkSize, 1000.0);
        let report = MilestoneReport::from_sender(60_000, 1_000.0, PartyStats::from_book(1, &book))
            .merge_relay(1_010.0, PartyStats::default())
            .merge_receiver(1_025.0, PartyStats::default());
        assert_eq!(report.sender.as_ref().map(|s| s.chunk_count), Some(1));
        assert_eq!(report.relay_time, Some(1_010.0));
        assert_eq!(report.sender_to_receiver_wall_delta(), Some(25.0));
        assert_eq!(report.label(), "1 min");
    }

    #[test]
    fn test_wall_delta_unavailable_without_sender_time() {
        let mut report = MilestoneReport::from_sender(60_000, 0.0, PartyStats::default());
        report.sender_time = None;
        let report = report.merge_receiver(5.0, PartyStats::default());
        assert_eq!(report.sender_to_receiver_wall_delta(), None);
    }

    #[test]
    fn test_report_survives_json() {
        let mut book = MetricBook::default();
        book.record(MetricCategory::NetworkDelay, 3.5);
        let report = MilestoneReport::from_sender(300_000, 42.0, PartyStats::from_book(9, &book));
        let json = serde_json::to_string(&report).unwrap();
        let back: MilestoneReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
