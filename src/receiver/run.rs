//! The receiver's event loop.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::time::Duration;

use super::append::Arrival;
use super::decoder::{spawn_sink, DecoderEvent, RenderSignal, SinkDecoder, SinkKind};
use super::{ReceiverIngest, ReceiverOutcome};
use crate::client::RelayLink;
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::probe::FrameProbe;
use crate::protocol::Message;
use crate::resources;
use crate::stats::MetricCategory;
use crate::storage::RunStorage;

pub async fn run(relay_url: &str, settings: &Settings, storage: &RunStorage) -> Result<()> {
    let clock = SystemClock::new();
    let mut link = RelayLink::connect(relay_url, clock).await?;

    let sink = match &settings.receiver.player {
        Some(command) => SinkKind::Player {
            command: command.clone(),
        },
        None => SinkKind::Null,
    };
    let render_signal = sink.render_signal();
    let (decoder, mut decoder_events) = spawn_sink(sink)?;
    let mut ingest: ReceiverIngest<SinkDecoder> = ReceiverIngest::new(
        decoder,
        settings.metrics.clone(),
        settings.receiver.queue_capacity,
        settings.receiver.retain_capacity,
        settings.receiver.queue_warn_depth,
    );
    let mut resource_rx = resources::spawn_from_settings(&settings.resources);
    println!("📺 Waiting for a stream from {}", relay_url);

    loop {
        tokio::select! {
            inbound = link.recv() => {
                let Some(inbound) = inbound else {
                    tracing::warn!("relay connection lost before end of transmission");
                    break;
                };
                match inbound.message {
                    Message::VideoFrame(envelope) => {
                        match ingest.on_chunk_arrived(envelope, inbound.received_at, inbound.received_wall) {
                            Arrival::Queued(depth) => tracing::trace!(depth, "chunk waiting behind in-flight append"),
                            Arrival::Overflow(e) => tracing::debug!(error = %e, "chunk lost to overflow"),
                            _ => {}
                        }
                    }
                    Message::Milestone(report) => {
                        if let Some(merged) = ingest.on_milestone(report, inbound.received_wall) {
                            tracing::info!(
                                mark = %merged.label(),
                                wall_delta_ms = ?merged.sender_to_receiver_wall_delta(),
                                "milestone"
                            );
                            if let Err(e) = storage.append_jsonl("milestones_receiver", &merged) {
                                tracing::warn!(error = %e, "failed to record milestone");
                            }
                        }
                    }
                    Message::TransmissionEnded => {
                        tracing::info!("transmission ended");
                        break;
                    }
                    other => tracing::debug!(kind = other.kind(), "ignored"),
                }
            }
            Some(event) = decoder_events.recv() => match event {
                DecoderEvent::AppendComplete(result) => ingest.on_append_complete(result, clock.monotonic_ms()),
                DecoderEvent::FrameRendered => ingest.on_frame_rendered(clock.monotonic_ms()),
            },
            Some(sample) = resources::next_sample(&mut resource_rx) => {
                ingest.record_resources(&sample);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    let Some(mut outcome) = ingest.on_transmission_ended() else {
        return Ok(());
    };
    outcome.report.render_signal = Some(render_signal);
    link.close().await;

    let artifact = storage.write_artifact("received", &outcome.artifact)?;
    storage.write_json("receiver_report", &outcome.report)?;
    storage.write_text("receiver_log", &reception_log(&outcome))?;
    print_summary(&outcome);

    if settings.probe.after_session {
        let duration = outcome.report.reception_duration_ms.unwrap_or(0.0).max(0.0);
        FrameProbe::new(settings.probe.program.clone())
            .probe_and_log(&artifact, Duration::from_secs_f64(duration / 1000.0))
            .await;
    }
    Ok(())
}

/// Plain-text reception window: T2 (first chunk), T3 (last chunk) and the
/// span between them, all receiver wall clock.
fn reception_log(outcome: &ReceiverOutcome) -> String {
    fn stamp(ms: Option<f64>) -> String {
        let Some(ms) = ms else {
            return "n/a".to_string();
        };
        match DateTime::<Utc>::from_timestamp_millis(ms as i64) {
            Some(t) => format!("{} UTC ({:.0})", t.format("%Y-%m-%d %H:%M:%S%.3f"), ms),
            None => format!("{:.0}", ms),
        }
    }

    let report = &outcome.report;
    let mut log = String::new();
    let _ = writeln!(log, "T2 first chunk received: {}", stamp(report.first_receive_wall));
    let _ = writeln!(log, "T3 last chunk received:  {}", stamp(report.last_receive_wall));
    match report.reception_duration_ms {
        Some(ms) => {
            let _ = writeln!(log, "Reception duration (T3 - T2): {:.0} ms ({:.2} s)", ms, ms / 1000.0);
        }
        None => {
            let _ = writeln!(log, "Reception duration (T3 - T2): n/a");
        }
    }
    let _ = writeln!(log, "Chunks received: {} ({} bytes)", report.chunk_count, report.total_bytes);
    let _ = writeln!(
        log,
        "Appended: {}  rejected: {}  overflowed: {}",
        report.appended, report.rejected, report.overflowed
    );
    log
}

fn print_summary(outcome: &ReceiverOutcome) {
    let report = &outcome.report;
    println!();
    println!("📊 Received {} chunks ({} bytes)", report.chunk_count, report.total_bytes);
    for (category, stats) in &report.metrics {
        println!("   {:<18} {} {}", category.as_str(), stats, category.unit());
    }
    if report.render_signal == Some(RenderSignal::PipeAccepted)
        && report.metrics.contains_key(&MetricCategory::DecodeToDisplay)
    {
        println!("   (decode_to_display ends when the player's stdin accepts the chunk, not at presentation)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::ReceiverReport;

    fn outcome(first: Option<f64>, last: Option<f64>) -> ReceiverOutcome {
        ReceiverOutcome {
            artifact: Vec::new(),
            report: ReceiverReport {
                chunk_count: 3,
                total_bytes: 300,
                out_of_order: 0,
                missing: 0,
                appended: 3,
                rejected: 0,
                overflowed: 0,
                queue_high_water: 1,
                first_receive_wall: first,
                last_receive_wall: last,
                reception_duration_ms: first.zip(last).map(|(a, b)| b - a),
                render_signal: Some(RenderSignal::PipeAccepted),
                metrics: Default::default(),
            },
        }
    }

    #[test]
    fn test_reception_log_lists_window() {
        let log = reception_log(&outcome(Some(1_700_000_000_000.0), Some(1_700_000_002_500.0)));
        assert!(log.contains("T2 first chunk received: 2023-11-14 22:13:20.000"));
        assert!(log.contains("Reception duration (T3 - T2): 2500 ms (2.50 s)"));
        assert!(log.contains("Chunks received: 3 (300 bytes)"));
    }

    #[tokio::test]
    async fn test_session_over_loopback_relay() {
        use crate::milestone::MilestoneReport;
        use crate::relay::RelayServer;
        use crate::sender::run::SendOptions;
        use crate::sender::source::SourceKind;

        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.output_dir = dir.path().join("relay");
        settings.resources.enabled = false;
        settings.probe.after_session = false;
        settings.milestones.marks_ms = vec![200];
        settings.sender.interval_ms = 20;
        settings.sender.duration_secs = 1;
        settings.sender.end_grace_ms = 100;

        let server = RelayServer::bind("127.0.0.1:0", settings.clone()).await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        tokio::spawn(server.run());

        let receiver_storage = RunStorage::with_stamp(dir.path().join("receiver"), "loop").unwrap();
        let receiver = {
            let (url, settings, storage) = (url.clone(), settings.clone(), receiver_storage.clone());
            tokio::spawn(async move { run(&url, &settings, &storage).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sender_storage = RunStorage::with_stamp(dir.path().join("sender"), "loop").unwrap();
        let options = SendOptions {
            relay_url: url,
            source: SourceKind::Synthetic {
                min_bytes: 64,
                max_bytes: 256,
            },
        };
        crate::sender::run::run(options, &settings, &sender_storage)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .expect("receiver never saw the end of transmission")
            .unwrap()
            .unwrap();

        // The 200 ms mark went sender -> relay -> receiver with every party merged
        let lines = std::fs::read_to_string(receiver_storage.path("milestones_receiver", "jsonl")).unwrap();
        let reports: Vec<MilestoneReport> = lines.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.mark_ms, 200);
        assert!(report.sender.is_some());
        assert!(report.relay.as_ref().is_some_and(|r| r.chunk_count > 0));
        assert!(report.receiver.is_some());
        assert!(report.sender_to_receiver_wall_delta().is_some());

        // The sender sees the relay's merged copy too
        assert!(sender_storage.path("milestones_sender", "jsonl").exists());

        let received = std::fs::read(receiver_storage.path("received", "webm")).unwrap();
        let recorded = std::fs::read(sender_storage.path("recorded", "webm")).unwrap();
        assert!(!received.is_empty());
        assert_eq!(received, recorded);
        assert!(receiver_storage.path("receiver_report", "json").exists());
    }

    #[test]
    fn test_reception_log_without_chunks() {
        let log = reception_log(&outcome(None, None));
        assert!(log.contains("T2 first chunk received: n/a"));
        assert!(log.contains("Reception duration (T3 - T2): n/a"));
    }
}
