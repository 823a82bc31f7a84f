pub mod hub;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};

use crate::clock::{Clock, Millis, SystemClock};
use crate::config::Settings;
use crate::resources;
use crate::storage::RunStorage;
use hub::{ConnId, HubOutput, RelayHub, RelayReport};

/// What connection tasks tell the hub.
#[derive(Debug)]
pub enum HubEvent {
    Join {
        id: ConnId,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    },
    Frame {
        id: ConnId,
        data: Vec<u8>,
        received_at: Millis,
        received_wall: Millis,
    },
    Leave {
        id: ConnId,
    },
}

/// Chunk relay
/// - Forwards every binary frame from one party to all the others
/// - Acks chunks back to their sender with the relay receive time
/// - Keeps relay-side timing aggregates, persisted at each session end
pub struct RelayServer {
    listener: TcpListener,
    settings: Settings,
    clock: SystemClock,
}

impl RelayServer {
    pub async fn bind(addr: &str, settings: Settings) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay on {}", addr))?;
        Ok(Self {
            listener,
            settings,
            clock: SystemClock::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        println!("📡 Relay listening on: ws://{}", addr);
        println!("📁 Reports go to: {}", self.settings.output_dir.display());
        println!();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let hub = RelayHub::new(self.settings.metrics.clone());
        let resource_rx = resources::spawn_from_settings(&self.settings.resources);
        tokio::spawn(run_hub(hub, event_rx, resource_rx, self.settings.output_dir.clone()));

        let mut next_id: ConnId = 0;
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            next_id += 1;
            let id = next_id;
            let events = event_tx.clone();
            let clock = self.clock;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, id, events, clock).await {
                    let err_str = e.to_string();
                    // Non-WebSocket connections (probes, scanners) are noise
                    if !err_str.contains("Connection: upgrade") && !err_str.contains("protocol error") {
                        tracing::warn!(conn = id, %peer, error = %e, "connection error");
                    }
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    id: ConnId,
    events: mpsc::UnboundedSender<HubEvent>,
    clock: SystemClock,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    events.send(HubEvent::Join { id, tx })?;

    // Spawn task to send frames to this party
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(WsMessage::Binary(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Binary(data)) => {
                let event = HubEvent::Frame {
                    id,
                    data,
                    received_at: clock.monotonic_ms(),
                    received_wall: clock.wall_ms(),
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    let _ = events.send(HubEvent::Leave { id });
    send_task.abort();
    Ok(())
}

async fn run_hub(
    mut hub: RelayHub,
    mut events: mpsc::UnboundedReceiver<HubEvent>,
    mut resource_rx: Option<mpsc::Receiver<resources::ResourceSample>>,
    output_dir: PathBuf,
) {
    // Milestones of the whole relay run share one file
    let run_storage = match RunStorage::new(&output_dir) {
        Ok(storage) => Some(storage),
        Err(e) => {
            tracing::error!(error = %e, "output directory unavailable, relay reports disabled");
            None
        }
    };

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    HubEvent::Join { id, tx } => hub.join(id, tx),
                    HubEvent::Leave { id } => hub.leave(id),
                    HubEvent::Frame { id, data, received_at, received_wall } => {
                        if let Some(output) = hub.on_frame(id, &data, received_at, received_wall) {
                            persist(&output, run_storage.as_ref(), &output_dir);
                        }
                    }
                }
            }
            Some(sample) = resources::next_sample(&mut resource_rx) => {
                hub.record_resources(&sample);
            }
        }
    }
}

fn persist(output: &HubOutput, run_storage: Option<&RunStorage>, output_dir: &std::path::Path) {
    let result = match output {
        HubOutput::Milestone(report) => match run_storage {
            Some(storage) => storage.append_jsonl("milestones_relay", report).map(|_| ()),
            None => Ok(()),
        },
        HubOutput::SessionEnded(report) => write_session_report(report, output_dir),
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "failed to persist relay output");
    }
}

/// Each session gets its own timestamped report
fn write_session_report(report: &RelayReport, output_dir: &std::path::Path) -> Result<()> {
    let storage = RunStorage::new(output_dir)?;
    storage.write_json("relay_report", report)?;
    Ok(())
}

pub async fn start_relay(addr: String, settings: Settings) -> Result<()> {
    let server = RelayServer::bind(&addr, settings).await?;
    server.run().await
}
