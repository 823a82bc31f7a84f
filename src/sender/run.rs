//! The sender's event loop.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

use super::source::{ChunkSource, SourceKind};
use super::{SenderOutcome, SenderTracker};
use crate::client::{Inbound, RelayLink};
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::milestone::MilestoneSchedule;
use crate::probe::FrameProbe;
use crate::protocol::Message;
use crate::resources;
use crate::storage::RunStorage;

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub relay_url: String,
    pub source: SourceKind,
}

/// Why the capture loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    DurationElapsed,
    SourceExhausted,
    Interrupted,
    RelayGone,
}

pub async fn run(options: SendOptions, settings: &Settings, storage: &RunStorage) -> Result<()> {
    let clock = SystemClock::new();
    let mut link = RelayLink::connect(&options.relay_url, clock).await?;

    let interval = Duration::from_millis(settings.sender.interval_ms);
    let mut source = ChunkSource::start(options.source.clone(), interval, clock).await?;
    let mut chunk_rx = source
        .take_chunk_rx()
        .context("chunk source already taken")?;
    let mut resource_rx = resources::spawn_from_settings(&settings.resources);

    let mut tracker = SenderTracker::new(settings.metrics.clone(), settings.sender.buffer_capacity);
    let mut schedule = MilestoneSchedule::new(settings.milestones.marks_ms.iter().copied());

    let started = Instant::now();
    tracker.start(clock.monotonic_ms());
    let stop_at = (settings.sender.duration_secs > 0)
        .then(|| started + Duration::from_secs(settings.sender.duration_secs));
    println!("🎬 Sharing to {} every {} ms", options.relay_url, settings.sender.interval_ms);
    tracing::debug!(marks_ms = ?schedule.marks(), "milestone schedule");

    let reason = loop {
        let next_mark = schedule
            .next_pending()
            .map(|mark| started + Duration::from_millis(mark));

        tokio::select! {
            chunk = chunk_rx.recv() => {
                let Some(chunk) = chunk else { break StopReason::SourceExhausted };
                if let Some(envelope) = tracker.on_chunk_produced(chunk.data, chunk.produced_at, chunk.produced_wall) {
                    if link.send(&Message::VideoFrame(envelope)).is_err() {
                        break StopReason::RelayGone;
                    }
                }
            }
            inbound = link.recv() => {
                let Some(inbound) = inbound else { break StopReason::RelayGone };
                handle_inbound(&mut tracker, inbound, storage);
            }
            Some(sample) = resources::next_sample(&mut resource_rx) => {
                tracker.record_resources(&sample);
            }
            _ = sleep_until(next_mark.unwrap_or(started)), if next_mark.is_some() => {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                for mark in schedule.due(elapsed) {
                    let report = tracker.on_milestone_timer(mark, clock.wall_ms());
                    tracing::info!(mark = %report.label(), chunks = tracker.chunk_count(), "milestone");
                    if let Err(e) = link.send(&Message::Milestone(report)) {
                        tracing::warn!(error = %e, "failed to submit milestone");
                    }
                }
                if schedule.is_complete() {
                    tracing::debug!("all milestones submitted");
                }
            }
            _ = sleep_until(stop_at.unwrap_or(started)), if stop_at.is_some() => {
                break StopReason::DurationElapsed;
            }
            _ = tokio::signal::ctrl_c() => {
                break StopReason::Interrupted;
            }
        }
    };

    tracing::info!(?reason, chunks = tracker.chunk_count(), dropped = source.dropped(), "capture stopped");
    source.stop();

    let outcome = tracker
        .on_session_stop(clock.monotonic_ms())
        .context("session stopped twice")?;
    let artifact = persist(&outcome, storage)?;

    if reason != StopReason::RelayGone {
        // Give in-flight chunks time to drain before announcing the end
        let grace = sleep(Duration::from_millis(settings.sender.end_grace_ms));
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = &mut grace => break,
                inbound = link.recv() => match inbound {
                    Some(inbound) => handle_inbound(&mut tracker, inbound, storage),
                    None => break,
                },
            }
        }
        if let Err(e) = link.send(&Message::ScreenShareEnded) {
            tracing::warn!(error = %e, "could not announce end of stream");
        } else {
            tracing::info!("screen-share-ended sent");
        }
    }
    link.close().await;

    print_summary(&outcome);
    if settings.probe.after_session {
        let duration = Duration::from_secs_f64(outcome.report.session_duration_ms.unwrap_or(0.0).max(0.0) / 1000.0);
        FrameProbe::new(settings.probe.program.clone())
            .probe_and_log(&artifact, duration)
            .await;
    }
    Ok(())
}

fn handle_inbound(tracker: &mut SenderTracker, inbound: Inbound, storage: &RunStorage) {
    match inbound.message {
        Message::AckFrame { idx, .. } => {
            if let Some(rtt) = tracker.on_ack(idx, inbound.received_at) {
                tracing::trace!(idx, rtt_ms = rtt, "ack");
            }
        }
        Message::FirstFrameAck { idx, relay_time } => {
            if let Some(rtt) = tracker.on_first_frame_ack(idx, relay_time, inbound.received_at) {
                tracing::info!(idx, rtt_ms = rtt, "first frame acknowledged");
            }
        }
        Message::Milestone(report) => {
            tracing::info!(
                mark = %report.label(),
                relay_chunks = ?report.relay.as_ref().map(|r| r.chunk_count),
                "milestone merged by relay"
            );
            if let Err(e) = storage.append_jsonl("milestones_sender", &report) {
                tracing::warn!(error = %e, "failed to record milestone");
            }
        }
        other => tracing::debug!(kind = other.kind(), "ignored"),
    }
}

fn persist(outcome: &SenderOutcome, storage: &RunStorage) -> Result<PathBuf> {
    let artifact = storage.write_artifact("recorded", &outcome.artifact)?;
    storage.write_json("sender_report", &outcome.report)?;
    Ok(artifact)
}

fn print_summary(outcome: &SenderOutcome) {
    let report = &outcome.report;
    println!();
    println!("📊 Sent {} chunks ({} bytes)", report.chunk_count, report.total_bytes);
    if let Some(rtt) = report.first_frame_rtt_ms {
        println!("   first frame RTT: {:.1} ms", rtt);
    }
    for (category, stats) in &report.metrics {
        println!("   {:<18} {} {}", category.as_str(), stats, category.unit());
    }
}
