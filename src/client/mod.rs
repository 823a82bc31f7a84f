//! Client side of a relay connection, shared by sender and receiver.
//!
//! The socket is split into a writer task fed by a channel and a reader
//! task that decodes frames and stamps their local arrival time, so the
//! owning event loop only ever sees typed messages.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::clock::{Clock, Millis, SystemClock};
use crate::protocol::{self, Message};

/// A decoded message with the local time it came off the socket.
#[derive(Debug)]
pub struct Inbound {
    pub message: Message,
    pub received_at: Millis,
    pub received_wall: Millis,
}

pub struct RelayLink {
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RelayLink {
    pub async fn connect(relay_url: &str, clock: SystemClock) -> Result<Self> {
        let (ws_stream, _) = connect_async(relay_url)
            .await
            .with_context(|| format!("Failed to connect to relay {}", relay_url))?;
        tracing::info!(relay = relay_url, "connected to relay");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_sender.send(WsMessage::Binary(frame)).await {
                    tracing::warn!(error = %e, "relay write failed");
                    return;
                }
            }
            // Every sender handle is gone: close politely
            let _ = ws_sender.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Binary(frame)) => {
                        let received_at = clock.monotonic_ms();
                        let received_wall = clock.wall_ms();
                        match protocol::decode(&frame) {
                            Ok(message) => {
                                let inbound = Inbound {
                                    message,
                                    received_at,
                                    received_wall,
                                };
                                if inbound_tx.send(inbound).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                let payload_bytes = protocol::payload(&frame).map(<[u8]>::len).ok();
                                tracing::warn!(error = %e, ?payload_bytes, "undecodable frame from relay");
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        tracing::info!("relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "relay read failed");
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            out_tx,
            inbound_rx,
            writer,
            reader,
        })
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        let frame = protocol::encode(message)?;
        self.out_tx
            .send(frame)
            .map_err(|_| anyhow::anyhow!("relay connection closed"))
    }

    /// Next message from the relay; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound_rx.recv().await
    }

    /// Flush queued frames, close the socket and stop reading.
    pub async fn close(self) {
        let Self {
            out_tx,
            writer,
            reader,
            ..
        } = self;
        drop(out_tx);
        let _ = writer.await;
        reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::relay::RelayServer;
    use std::time::Duration;

    #[tokio::test]
    async fn test_link_round_trip_through_relay() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.output_dir = dir.path().to_path_buf();
        settings.resources.enabled = false;
        let server = RelayServer::bind("127.0.0.1:0", settings).await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        tokio::spawn(server.run());

        let clock = SystemClock::new();
        let sender = RelayLink::connect(&url, clock).await.unwrap();
        let mut receiver = RelayLink::connect(&url, clock).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        sender.send(&Message::ScreenShareEnded).unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.message, Message::TransmissionEnded);
        assert!(inbound.received_at >= 0.0);

        sender.close().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = RelayLink::connect(&format!("ws://{}", addr), SystemClock::new()).await;
        assert!(result.is_err());
    }
}
