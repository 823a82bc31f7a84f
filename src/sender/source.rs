//! Chunk sources standing in for the capture API.
//!
//! Both sources run as their own task and push timestamped chunks into a
//! bounded channel. If the event loop falls behind, chunks are dropped at the
//! source rather than piling up.

use anyhow::{Context, Result};
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::clock::{Clock, Millis, SystemClock};

const CHANNEL_CAPACITY: usize = 8;

/// One chunk as the capture side hands it over.
#[derive(Debug)]
pub struct SourceChunk {
    pub data: Vec<u8>,
    /// Monotonic time the chunk was produced
    pub produced_at: Millis,
    pub produced_wall: Millis,
}

#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Replay an encoded media file in fixed-size slices
    File { path: PathBuf, slice_bytes: usize },
    /// Random payloads with sizes in `min..=max`
    Synthetic { min_bytes: usize, max_bytes: usize },
}

pub struct ChunkSource {
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    chunk_rx: Option<mpsc::Receiver<SourceChunk>>,
}

impl ChunkSource {
    /// Start producing one chunk per `interval`.
    pub async fn start(kind: SourceKind, interval: Duration, clock: SystemClock) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let producer: Box<dyn FnMut() -> Option<Vec<u8>> + Send> = match kind {
            SourceKind::File { path, slice_bytes } => {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read source file {}", path.display()))?;
                anyhow::ensure!(!data.is_empty(), "source file {} is empty", path.display());
                tracing::info!(path = %path.display(), bytes = data.len(), slice_bytes, "file source ready");
                Box::new(file_slices(data, slice_bytes))
            }
            SourceKind::Synthetic {
                min_bytes,
                max_bytes,
            } => {
                tracing::info!(min_bytes, max_bytes, "synthetic source ready");
                Box::new(move || Some(synthetic_chunk(min_bytes, max_bytes)))
            }
        };

        tokio::spawn(produce_loop(
            producer,
            interval,
            clock,
            tx,
            running.clone(),
            dropped.clone(),
        ));

        Ok(Self {
            running,
            dropped,
            chunk_rx: Some(rx),
        })
    }

    /// Take the chunk receiver (can only be called once)
    pub fn take_chunk_rx(&mut self) -> Option<mpsc::Receiver<SourceChunk>> {
        self.chunk_rx.take()
    }

    /// Chunks dropped because the consumer was behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for ChunkSource {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn produce_loop(
    mut next_chunk: Box<dyn FnMut() -> Option<Vec<u8>> + Send>,
    interval: Duration,
    clock: SystemClock,
    tx: mpsc::Sender<SourceChunk>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the first chunk should come
    // one interval after start, like a recorder's timeslice
    ticker.tick().await;

    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let Some(data) = next_chunk() else {
            tracing::info!("source exhausted");
            break;
        };
        let chunk = SourceChunk {
            data,
            produced_at: clock.monotonic_ms(),
            produced_wall: clock.wall_ms(),
        };
        match tx.try_send(chunk) {
            Ok(_) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Consumer is behind, skip this chunk
                dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("source backpressure, chunk dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

/// Successive `slice_bytes` pieces of `data`, then `None`.
fn file_slices(data: Vec<u8>, slice_bytes: usize) -> impl FnMut() -> Option<Vec<u8>> + Send {
    let slice_bytes = slice_bytes.max(1);
    let mut offset = 0usize;
    move || {
        if offset >= data.len() {
            return None;
        }
        let end = (offset + slice_bytes).min(data.len());
        let slice = data[offset..end].to_vec();
        offset = end;
        Some(slice)
    }
}

fn synthetic_chunk(min_bytes: usize, max_bytes: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(min_bytes.max(1)..=max_bytes.max(min_bytes.max(1)));
    let mut data = vec![0u8; len];
    rng.fill(data.as_mut_slice());
    data
}
