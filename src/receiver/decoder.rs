//! Decoder sinks. Each runs as its own task, takes one chunk at a time and
//! reports back through a [`DecoderEvent`] channel.

use anyhow::{Context, Result};
use serde::Serialize;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::append::{DecodeError, Decoder};
use crate::protocol::Chunk;

#[derive(Debug, PartialEq)]
pub enum DecoderEvent {
    AppendComplete(Result<(), DecodeError>),
    /// Only sinks with a presentation side emit this
    FrameRendered,
}

#[derive(Debug, Clone)]
pub enum SinkKind {
    /// Accept and discard
    Null,
    /// Pipe chunks into an external player's stdin, e.g. `ffplay -`
    Player { command: String },
}

/// What a `FrameRendered` event from a sink actually observes, so the
/// decode-to-display figure can be read for what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderSignal {
    /// The sink never reports rendered frames
    None,
    /// The player's stdin accepted the bytes; on-screen presentation is
    /// not observable through a pipe
    PipeAccepted,
}

impl SinkKind {
    pub fn render_signal(&self) -> RenderSignal {
        match self {
            SinkKind::Null => RenderSignal::None,
            SinkKind::Player { .. } => RenderSignal::PipeAccepted,
        }
    }
}

/// Handle the append pipeline submits through.
pub struct SinkDecoder {
    tx: mpsc::UnboundedSender<Chunk>,
}

impl Decoder for SinkDecoder {
    fn submit(&mut self, chunk: &Chunk) -> Result<(), DecodeError> {
        if chunk.data.is_empty() {
            return Err(DecodeError::Rejected {
                idx: chunk.idx,
                reason: "empty chunk".into(),
            });
        }
        self.tx.send(chunk.clone()).map_err(|_| DecodeError::Closed)
    }
}

pub fn spawn_sink(kind: SinkKind) -> Result<(SinkDecoder, mpsc::UnboundedReceiver<DecoderEvent>)> {
    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    match kind {
        SinkKind::Null => {
            tokio::spawn(null_sink(chunk_rx, event_tx));
        }
        SinkKind::Player { command } => {
            let mut parts = command.split_whitespace();
            let program = parts.next().context("empty player command")?;
            let mut child = tokio::process::Command::new(program)
                .args(parts)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("Failed to start player `{}`", command))?;
            let stdin = child.stdin.take().context("player has no stdin")?;
            tracing::info!(%command, "player sink started");
            tokio::spawn(player_sink(child, stdin, chunk_rx, event_tx));
        }
    }

    Ok((SinkDecoder { tx: chunk_tx }, event_rx))
}

async fn null_sink(mut chunk_rx: mpsc::UnboundedReceiver<Chunk>, event_tx: mpsc::UnboundedSender<DecoderEvent>) {
    while let Some(_chunk) = chunk_rx.recv().await {
        if event_tx.send(DecoderEvent::AppendComplete(Ok(()))).is_err() {
            break;
        }
    }
}

async fn player_sink(
    mut child: tokio::process::Child,
    mut stdin: tokio::process::ChildStdin,
    mut chunk_rx: mpsc::UnboundedReceiver<Chunk>,
    event_tx: mpsc::UnboundedSender<DecoderEvent>,
) {
    while let Some(chunk) = chunk_rx.recv().await {
        let written = async {
            stdin.write_all(&chunk.data).await?;
            stdin.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                let _ = event_tx.send(DecoderEvent::AppendComplete(Ok(())));
                // Pipe acceptance stands in for presentation, see RenderSignal
                let _ = event_tx.send(DecoderEvent::FrameRendered);
            }
            Err(e) => {
                tracing::error!(idx = chunk.idx, error = %e, "player stopped accepting data");
                // Refuse further submits before reporting, so the pipeline
                // sees Closed instead of waiting on a dead sink
                chunk_rx.close();
                let _ = event_tx.send(DecoderEvent::AppendComplete(Err(DecodeError::Rejected {
                    idx: chunk.idx,
                    reason: e.to_string(),
                })));
                break;
            }
        }
    }

    // Anything already queued in the channel still owes a completion
    while let Some(chunk) = chunk_rx.recv().await {
        tracing::debug!(idx = chunk.idx, "player gone, chunk not written");
        let _ = event_tx.send(DecoderEvent::AppendComplete(Err(DecodeError::Closed)));
    }

    // Closing stdin lets the player drain and exit on its own
    drop(stdin);
    match child.wait().await {
        Ok(status) => tracing::info!(%status, "player exited"),
        Err(e) => tracing::warn!(error = %e, "failed to reap player"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(idx: u64, len: usize) -> Chunk {
        Chunk {
            idx,
            duration_ms: Some(150.0),
            data: vec![1u8; len],
        }
    }

    #[tokio::test]
    async fn test_null_sink_completes_every_append() {
        let (mut decoder, mut events) = spawn_sink(SinkKind::Null).unwrap();
        for idx in 1..=3 {
            decoder.submit(&chunk(idx, 10)).unwrap();
        }
        for _ in 0..3 {
            assert_eq!(events.recv().await, Some(DecoderEvent::AppendComplete(Ok(()))));
        }
    }

    #[tokio::test]
    async fn test_empty_chunk_refused_synchronously() {
        let (mut decoder, _events) = spawn_sink(SinkKind::Null).unwrap();
        let err = decoder.submit(&chunk(5, 0)).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Rejected {
                idx: 5,
                reason: "empty chunk".into()
            }
        );
    }

    #[tokio::test]
    async fn test_closed_sink_reports_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut decoder = SinkDecoder { tx };
        assert_eq!(decoder.submit(&chunk(1, 4)), Err(DecodeError::Closed));
    }

    #[tokio::test]
    async fn test_missing_player_fails_to_start() {
        let result = spawn_sink(SinkKind::Player {
            command: "/nonexistent/player -".into(),
        });
        assert!(result.is_err());
        assert!(spawn_sink(SinkKind::Player { command: "  ".into() }).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dead_player_does_not_stall_pipeline() {
        use crate::receiver::append::{AppendPipeline, AppendState, Arrival};
        use std::time::Duration;

        // `true` exits at once, so every write hits a closed pipe
        let (decoder, mut events) = spawn_sink(SinkKind::Player {
            command: "true".into(),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut pipeline = AppendPipeline::new(decoder, 16, 16);
        for idx in 1..=3 {
            pipeline.on_chunk_arrived(chunk(idx, 32), idx as f64);
        }
        while pipeline.state() != AppendState::Idle {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("pipeline stuck waiting on a dead player")
                .expect("sink dropped its event channel");
            if let DecoderEvent::AppendComplete(result) = event {
                pipeline.on_append_complete(result, 10.0);
            }
        }
        assert_eq!(pipeline.queue_len(), 0);
        assert_eq!(pipeline.counters().rejected, 3);

        // Later arrivals are refused on the spot
        assert_eq!(pipeline.on_chunk_arrived(chunk(4, 32), 20.0), Arrival::Rejected);
        assert_eq!(pipeline.state(), AppendState::Idle);
    }

    #[test]
    fn test_render_signal_per_sink() {
        assert_eq!(SinkKind::Null.render_signal(), RenderSignal::None);
        let player = SinkKind::Player {
            command: "ffplay -".into(),
        };
        assert_eq!(player.render_signal(), RenderSignal::PipeAccepted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_player_sink_reports_render() {
        let (mut decoder, mut events) = spawn_sink(SinkKind::Player {
            command: "cat".into(),
        })
        .unwrap();
        decoder.submit(&chunk(1, 64)).unwrap();
        assert_eq!(events.recv().await, Some(DecoderEvent::AppendComplete(Ok(()))));
        assert_eq!(events.recv().await, Some(DecoderEvent::FrameRendered));
    }
}
