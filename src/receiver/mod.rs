//! Receiver ingest: timing metrics on arrival, then the append pipeline.

pub mod append;
pub mod decoder;
pub mod run;

use serde::Serialize;

use crate::clock::{ClockReconciler, Millis};
use crate::milestone::{MilestoneReport, MilestoneSchedule, PartyStats};
use crate::protocol::{Chunk, Envelope};
use crate::resources::ResourceSample;
use crate::stats::{MetricBook, MetricCategory, MetricSet, MetricsSnapshot};
use append::{AppendPipeline, Arrival, DecodeError, Decoder};
use decoder::RenderSignal;
#[cfg(test)]
use append::{AppendCounters, AppendState};

#[derive(Debug, Clone, Serialize)]
pub struct ReceiverReport {
    pub chunk_count: u64,
    pub total_bytes: u64,
    /// Chunks that arrived with a sequence index at or below the last one
    pub out_of_order: u64,
    /// Sequence gaps observed (chunks never received)
    pub missing: u64,
    pub appended: u64,
    pub rejected: u64,
    pub overflowed: u64,
    pub queue_high_water: usize,
    /// Wall clock of the first and last received chunk (T2, T3)
    pub first_receive_wall: Option<Millis>,
    pub last_receive_wall: Option<Millis>,
    /// T3 − T2
    pub reception_duration_ms: Option<Millis>,
    /// What `decode_to_display` was measured against; set by the run loop
    /// from the sink in use
    pub render_signal: Option<RenderSignal>,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug)]
pub struct ReceiverOutcome {
    /// Retained chunks concatenated in arrival order
    pub artifact: Vec<u8>,
    pub report: ReceiverReport,
}

pub struct ReceiverIngest<D> {
    pipeline: AppendPipeline<D>,
    book: MetricBook,
    /// Where the playback schedule says the next chunk should land
    expected_arrival: Option<Millis>,
    last_arrival: Option<Millis>,
    last_idx: Option<u64>,
    sender_clock: ClockReconciler,
    milestones: MilestoneSchedule,
    chunk_count: u64,
    total_bytes: u64,
    out_of_order: u64,
    missing: u64,
    first_receive_wall: Option<Millis>,
    last_receive_wall: Option<Millis>,
    queue_warn_depth: usize,
    backlog_warned: bool,
}

impl<D: Decoder> ReceiverIngest<D> {
    pub fn new(
        decoder: D,
        metrics: MetricSet,
        queue_capacity: usize,
        retain_capacity: usize,
        queue_warn_depth: usize,
    ) -> Self {
        Self {
            pipeline: AppendPipeline::new(decoder, queue_capacity, retain_capacity),
            book: MetricBook::new(metrics),
            expected_arrival: None,
            last_arrival: None,
            last_idx: None,
            sender_clock: ClockReconciler::new(),
            milestones: MilestoneSchedule::new(std::iter::empty()),
            chunk_count: 0,
            total_bytes: 0,
            out_of_order: 0,
            missing: 0,
            first_receive_wall: None,
            last_receive_wall: None,
            queue_warn_depth: queue_warn_depth.max(1),
            backlog_warned: false,
        }
    }

    #[cfg(test)]
    pub fn book(&self) -> &MetricBook {
        &self.book
    }

    #[cfg(test)]
    pub fn state(&self) -> AppendState {
        self.pipeline.state()
    }

    #[cfg(test)]
    pub fn counters(&self) -> AppendCounters {
        self.pipeline.counters()
    }

    pub fn queue_len(&self) -> usize {
        self.pipeline.queue_len()
    }

    pub fn is_ended(&self) -> bool {
        self.pipeline.is_terminal()
    }

    #[cfg(test)]
    pub fn decoder(&self) -> &D {
        self.pipeline.decoder()
    }

    #[cfg(test)]
    pub fn decoder_mut(&mut self) -> &mut D {
        self.pipeline.decoder_mut()
    }

    /// A `video-frame` arrived. `now` is local monotonic time, `wall_now`
    /// local wall time.
    pub fn on_chunk_arrived(&mut self, envelope: Envelope, now: Millis, wall_now: Millis) -> Arrival {
        if self.is_ended() {
            return self.pipeline.on_chunk_arrived(envelope.chunk, now);
        }
        let Envelope { chunk, stamps, .. } = envelope;

        self.track_sequence(&chunk);
        self.chunk_count += 1;
        self.total_bytes += chunk.size() as u64;
        self.first_receive_wall.get_or_insert(wall_now);
        self.last_receive_wall = Some(wall_now);

        // Schedule-relative delay: did this chunk land when the sender's
        // pacing says it should have?
        match chunk.duration_ms {
            Some(duration) => {
                let expected = match self.expected_arrival {
                    None => now,
                    Some(expected) => expected + duration,
                };
                self.expected_arrival = Some(expected);
                self.book.record(MetricCategory::NetworkDelay, now - expected);
                tracing::debug!(idx = chunk.idx, delay_ms = now - expected, "chunk arrived");
            }
            None => tracing::debug!(idx = chunk.idx, "chunk without pacing info, delay unavailable"),
        }

        if let Some(last) = self.last_arrival {
            self.book.record(MetricCategory::ArrivalInterval, now - last);
        }
        self.last_arrival = Some(now);

        if let Some(transit) = self.sender_clock.transit(stamps.sent_at, now) {
            self.book.record(MetricCategory::EndToEndTransit, transit);
        }

        let arrival = self.pipeline.on_chunk_arrived(chunk, now);
        self.observe_queue();
        arrival
    }

    pub fn on_append_complete(&mut self, result: Result<(), DecodeError>, now: Millis) {
        self.pipeline.on_append_complete(result, now);
        self.observe_queue();
    }

    pub fn on_frame_rendered(&mut self, now: Millis) {
        if let Some(delay) = self.pipeline.on_frame_rendered(now) {
            self.book.record(MetricCategory::DecodeToDisplay, delay);
            tracing::trace!(delay_ms = delay, "decode to display");
        }
    }

    pub fn record_resources(&mut self, sample: &ResourceSample) {
        sample.record_into(&mut self.book);
    }

    /// A relayed milestone. Returns the report with this receiver's
    /// aggregates folded in, or `None` for a mark already handled.
    pub fn on_milestone(&mut self, report: MilestoneReport, wall_now: Millis) -> Option<MilestoneReport> {
        if !self.milestones.claim(report.mark_ms) {
            tracing::debug!(mark_ms = report.mark_ms, "duplicate milestone ignored");
            return None;
        }
        Some(report.merge_receiver(wall_now, PartyStats::from_book(self.chunk_count, &self.book)))
    }

    /// End of transmission. Freezes the aggregates and hands back the
    /// artifact and final report; later calls return `None`.
    pub fn on_transmission_ended(&mut self) -> Option<ReceiverOutcome> {
        let chunks = self.pipeline.finish()?;
        self.book.freeze();

        let mut artifact = Vec::with_capacity(chunks.iter().map(Chunk::size).sum());
        for chunk in &chunks {
            artifact.extend_from_slice(&chunk.data);
        }
        let counters = self.pipeline.counters();
        let reception_duration_ms = match (self.first_receive_wall, self.last_receive_wall) {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        };

        Some(ReceiverOutcome {
            artifact,
            report: ReceiverReport {
                chunk_count: self.chunk_count,
                total_bytes: self.total_bytes,
                out_of_order: self.out_of_order,
                missing: self.missing,
                appended: counters.appended,
                rejected: counters.rejected,
                overflowed: counters.overflowed,
                queue_high_water: self.pipeline.queue_high_water(),
                first_receive_wall: self.first_receive_wall,
                last_receive_wall: self.last_receive_wall,
                reception_duration_ms,
                render_signal: None,
                metrics: self.book.snapshot(),
            },
        })
    }

    fn track_sequence(&mut self, chunk: &Chunk) {
        if let Some(last) = self.last_idx {
            if chunk.idx <= last {
                self.out_of_order += 1;
                tracing::warn!(idx = chunk.idx, last, "chunk out of sequence");
                return;
            }
            let gap = chunk.idx - last - 1;
            if gap > 0 {
                self.missing += gap;
                tracing::warn!(idx = chunk.idx, gap, "sequence gap");
            }
        }
        self.last_idx = Some(chunk.idx);
    }

    fn observe_queue(&mut self) {
        let depth = self.pipeline.queue_len();
        self.book.record(MetricCategory::QueueDepth, depth as f64);
        if depth >= self.queue_warn_depth && !self.backlog_warned {
            self.backlog_warned = true;
            tracing::warn!(depth, "decoder falling behind, append queue growing");
        } else if depth < self.queue_warn_depth / 2 && self.backlog_warned {
            self.backlog_warned = false;
            tracing::info!(depth, "append backlog drained");
        }
    }
}
