//! Sender-side pacing and metrics.
//!
//! [`SenderTracker`] is plain state driven by the sender's event loop: it
//! turns produced chunks into envelopes, pairs relay acks with send times,
//! snapshots milestones, and hands back the recorded artifact at stop.

pub mod run;
pub mod source;

use serde::Serialize;
use std::collections::VecDeque;

use crate::buffer::{BoundedQueue, OverflowPolicy};
use crate::clock::{ClockReconciler, Millis};
use crate::milestone::{MilestoneReport, PartyStats};
use crate::protocol::{Chunk, Envelope};
use crate::resources::ResourceSample;
use crate::stats::{MetricBook, MetricCategory, MetricSet, MetricsSnapshot};

/// Unacked send times kept for RTT pairing. A relay that stops acking
/// cannot make this grow past the cap.
const MAX_IN_FLIGHT: usize = 1024;

/// Final sender-side statistics, written next to the recorded artifact.
#[derive(Debug, Clone, Serialize)]
pub struct SenderReport {
    pub chunk_count: u64,
    pub total_bytes: u64,
    /// Chunks dropped from the retained buffer (not from the stream)
    pub evicted_chunks: u64,
    pub first_frame_rtt_ms: Option<Millis>,
    /// Relay monotonic clock minus sender monotonic clock, estimated at the
    /// first-frame ack
    pub relay_clock_offset_ms: Option<Millis>,
    pub session_duration_ms: Option<Millis>,
    pub metrics: MetricsSnapshot,
}

/// What `on_session_stop` hands back for persistence.
#[derive(Debug)]
pub struct SenderOutcome {
    /// Retained chunks concatenated in sequence order
    pub artifact: Vec<u8>,
    pub report: SenderReport,
}

pub struct SenderTracker {
    next_idx: u64,
    last_chunk_at: Option<Millis>,
    started_at: Option<Millis>,
    stopped_at: Option<Millis>,
    chunk_count: u64,
    total_bytes: u64,
    book: MetricBook,
    in_flight: VecDeque<(u64, Millis)>,
    retained: BoundedQueue<Chunk>,
    first_frame_rtt: Option<Millis>,
    relay_clock: ClockReconciler,
}

impl SenderTracker {
    pub fn new(metrics: MetricSet, buffer_capacity: usize) -> Self {
        Self {
            next_idx: 1,
            last_chunk_at: None,
            started_at: None,
            stopped_at: None,
            chunk_count: 0,
            total_bytes: 0,
            book: MetricBook::new(metrics),
            in_flight: VecDeque::new(),
            retained: BoundedQueue::new(buffer_capacity, OverflowPolicy::DropOldest),
            first_frame_rtt: None,
            relay_clock: ClockReconciler::new(),
        }
    }

    /// Mark the session start; milestone marks count from here.
    pub fn start(&mut self, now: Millis) {
        self.started_at.get_or_insert(now);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }

    pub fn elapsed(&self, now: Millis) -> Option<Millis> {
        self.started_at.map(|start| now - start)
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    #[cfg(test)]
    pub fn book(&self) -> &MetricBook {
        &self.book
    }

    /// A chunk came out of the source. Returns the envelope to send, or
    /// `None` when the chunk is empty or the session has already stopped.
    pub fn on_chunk_produced(
        &mut self,
        data: Vec<u8>,
        produced_at: Millis,
        produced_wall: Millis,
    ) -> Option<Envelope> {
        if self.is_stopped() {
            tracing::warn!(bytes = data.len(), "chunk produced after stop, discarding");
            return None;
        }
        if data.is_empty() {
            tracing::debug!("empty chunk from source, skipping");
            return None;
        }
        self.start(produced_at);

        let first = self.last_chunk_at.is_none();
        let duration = self
            .last_chunk_at
            .map(|last| produced_at - last)
            .unwrap_or(0.0);
        self.last_chunk_at = Some(produced_at);

        let idx = self.next_idx;
        self.next_idx += 1;
        self.chunk_count += 1;
        self.total_bytes += data.len() as u64;

        self.book.record(MetricCategory::ChunkSize, data.len() as f64);
        if !first {
            self.book.record(MetricCategory::ChunkDuration, duration);
        }

        let chunk = Chunk {
            idx,
            duration_ms: Some(duration),
            data,
        };
        if let Ok(Some(evicted)) = self.retained.push(chunk.clone()) {
            tracing::debug!(idx = evicted.idx, "retained buffer full, evicted oldest chunk");
        }

        if self.in_flight.len() == MAX_IN_FLIGHT {
            self.in_flight.pop_front();
        }
        self.in_flight.push_back((idx, produced_at));

        tracing::trace!(idx, duration_ms = duration, "chunk produced");
        Some(Envelope::new(chunk, produced_at, produced_wall, first))
    }

    /// The relay acknowledged chunk `idx`. Returns the round-trip time when
    /// the ack matches a chunk still awaiting one.
    ///
    /// Acks arrive in send order over one connection, so anything older
    /// than `idx` still in flight will never be acked and is discarded.
    pub fn on_ack(&mut self, idx: u64, ack_at: Millis) -> Option<Millis> {
        while let Some(&(front, sent_at)) = self.in_flight.front() {
            if front < idx {
                self.in_flight.pop_front();
                continue;
            }
            if front == idx {
                self.in_flight.pop_front();
                let rtt = ack_at - sent_at;
                self.book.record(MetricCategory::OneWayLatency, rtt / 2.0);
                return Some(rtt);
            }
            break;
        }
        tracing::debug!(idx, "ack for unknown chunk");
        None
    }

    /// First-frame ack: regular RTT pairing plus a one-off estimate of the
    /// relay clock's offset, assuming a symmetric path.
    pub fn on_first_frame_ack(
        &mut self,
        idx: u64,
        relay_time: Option<Millis>,
        ack_at: Millis,
    ) -> Option<Millis> {
        let rtt = self.on_ack(idx, ack_at)?;
        self.first_frame_rtt = Some(rtt);
        // The relay stamped halfway through the round trip
        let midpoint = ack_at - rtt / 2.0;
        self.relay_clock.reset();
        self.relay_clock.observe(relay_time, midpoint);
        Some(rtt)
    }

    pub fn record_resources(&mut self, sample: &ResourceSample) {
        sample.record_into(&mut self.book);
    }

    pub fn on_milestone_timer(&self, mark_ms: u64, wall_now: Millis) -> MilestoneReport {
        MilestoneReport::from_sender(
            mark_ms,
            wall_now,
            PartyStats::from_book(self.chunk_count, &self.book),
        )
    }

    /// Stop the session. Safe to call more than once; only the first call
    /// yields an outcome.
    pub fn on_session_stop(&mut self, now: Millis) -> Option<SenderOutcome> {
        if self.is_stopped() {
            return None;
        }
        self.stopped_at = Some(now);
        self.book.freeze();

        let evicted_chunks = self.retained.evicted();
        let chunks = self.retained.drain();
        let mut artifact = Vec::with_capacity(chunks.iter().map(Chunk::size).sum());
        for chunk in &chunks {
            artifact.extend_from_slice(&chunk.data);
        }

        Some(SenderOutcome {
            artifact,
            report: SenderReport {
                chunk_count: self.chunk_count,
                total_bytes: self.total_bytes,
                evicted_chunks,
                first_frame_rtt_ms: self.first_frame_rtt,
                relay_clock_offset_ms: self.relay_clock.offset().map(|o| -o),
                session_duration_ms: self.elapsed(now),
                metrics: self.book.snapshot(),
            },
        })
    }
}
