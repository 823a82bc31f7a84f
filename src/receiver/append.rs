//! Buffered-append state machine in front of a single-slot decoder.
//!
//! A streaming decoder accepts one append at a time and signals when it is
//! ready for more. Chunks that arrive while an append is in flight wait in a
//! FIFO queue; the queue is drained one chunk per completion. The single
//! `Appending` state is the only thing guarding the decoder slot.

use thiserror::Error;

use crate::buffer::{BoundedQueue, OverflowPolicy, QueueError};
use crate::clock::Millis;
use crate::protocol::Chunk;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("decoder rejected chunk #{idx}: {reason}")]
    Rejected { idx: u64, reason: String },
    #[error("decoder is closed")]
    Closed,
}

/// The opaque consumer side. `submit` starts an append; completion is
/// reported back through [`AppendPipeline::on_append_complete`].
pub trait Decoder {
    fn submit(&mut self, chunk: &Chunk) -> Result<(), DecodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppendState {
    Idle,
    Appending { idx: u64, submitted_at: Millis },
}

/// What happened to an arriving chunk.
#[derive(Debug, PartialEq)]
pub enum Arrival {
    /// Went straight to the decoder
    Submitted,
    /// Waiting behind the in-flight append, at this queue depth
    Queued(usize),
    /// Queue full; chunk dropped
    Overflow(QueueError),
    /// The decoder refused it; dropped
    Rejected,
    /// Pipeline already terminal; chunk discarded
    Discarded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppendCounters {
    pub submitted: u64,
    pub appended: u64,
    pub rejected: u64,
    pub overflowed: u64,
    pub discarded: u64,
}

pub struct AppendPipeline<D> {
    decoder: D,
    state: AppendState,
    in_flight: Option<Chunk>,
    queue: BoundedQueue<Chunk>,
    appended: BoundedQueue<Chunk>,
    /// Submission time of the last completed append, waiting for a render
    pending_render: Option<Millis>,
    counters: AppendCounters,
    terminal: bool,
}

impl<D: Decoder> AppendPipeline<D> {
    pub fn new(decoder: D, queue_capacity: usize, retain_capacity: usize) -> Self {
        Self {
            decoder,
            state: AppendState::Idle,
            in_flight: None,
            queue: BoundedQueue::new(queue_capacity, OverflowPolicy::Reject),
            appended: BoundedQueue::new(retain_capacity, OverflowPolicy::DropOldest),
            pending_render: None,
            counters: AppendCounters::default(),
            terminal: false,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> AppendState {
        self.state
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_high_water(&self) -> usize {
        self.queue.high_water()
    }

    pub fn counters(&self) -> AppendCounters {
        self.counters
    }

    #[cfg(test)]
    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    #[cfg(test)]
    pub fn decoder_mut(&mut self) -> &mut D {
        &mut self.decoder
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn on_chunk_arrived(&mut self, chunk: Chunk, now: Millis) -> Arrival {
        if self.terminal {
            self.counters.discarded += 1;
            tracing::warn!(idx = chunk.idx, "chunk after end of transmission, discarding");
            return Arrival::Discarded;
        }
        match self.state {
            AppendState::Appending { .. } => match self.queue.push(chunk) {
                Ok(_) => Arrival::Queued(self.queue.len()),
                Err(e) => {
                    self.counters.overflowed += 1;
                    tracing::error!(error = %e, "append queue overflow, chunk dropped");
                    Arrival::Overflow(e)
                }
            },
            AppendState::Idle => {
                if self.submit(chunk, now) {
                    Arrival::Submitted
                } else {
                    self.submit_next(now);
                    Arrival::Rejected
                }
            }
        }
    }

    /// The decoder finished the in-flight append, successfully or not.
    pub fn on_append_complete(&mut self, result: Result<(), DecodeError>, now: Millis) {
        let AppendState::Appending { idx, submitted_at } = self.state else {
            tracing::warn!("append completion with nothing in flight, ignoring");
            return;
        };
        let chunk = self.in_flight.take();
        self.state = AppendState::Idle;

        match result {
            Ok(()) => {
                self.counters.appended += 1;
                self.pending_render = Some(submitted_at);
                if let Some(chunk) = chunk {
                    if let Ok(Some(evicted)) = self.appended.push(chunk) {
                        tracing::debug!(idx = evicted.idx, "retained buffer full, evicted oldest chunk");
                    }
                }
            }
            Err(e) => {
                self.counters.rejected += 1;
                tracing::warn!(idx, error = %e, "append failed, chunk dropped");
            }
        }

        if !self.terminal {
            self.submit_next(now);
        }
    }

    /// A frame reached the screen. Yields the decode-to-display delay for
    /// the most recently completed append, once.
    pub fn on_frame_rendered(&mut self, now: Millis) -> Option<Millis> {
        self.pending_render.take().map(|submitted_at| now - submitted_at)
    }

    /// Enter the terminal state and hand back every chunk that was not
    /// rejected, in arrival order: appended, then in flight, then queued.
    pub fn finish(&mut self) -> Option<Vec<Chunk>> {
        if self.terminal {
            return None;
        }
        self.terminal = true;
        let mut chunks = self.appended.drain();
        chunks.extend(self.in_flight.clone());
        chunks.extend(self.queue.drain());
        Some(chunks)
    }

    /// Hand `chunk` to the decoder. A refused chunk is dropped; the caller
    /// moves on to the next queued chunk so a bad chunk never stalls the
    /// pipeline. Returns whether `chunk` was accepted.
    fn submit(&mut self, chunk: Chunk, now: Millis) -> bool {
        debug_assert!(self.in_flight.is_none(), "second append while one is in flight");
        match self.decoder.submit(&chunk) {
            Ok(()) => {
                self.counters.submitted += 1;
                self.state = AppendState::Appending {
                    idx: chunk.idx,
                    submitted_at: now,
                };
                self.in_flight = Some(chunk);
                true
            }
            Err(e) => {
                self.counters.rejected += 1;
                tracing::warn!(idx = chunk.idx, error = %e, "decoder refused chunk, dropped");
                false
            }
        }
    }

    fn submit_next(&mut self, now: Millis) {
        while let Some(next) = self.queue.pop() {
            if self.submit(next, now) {
                return;
            }
        }
    }
}
