//! Relay state: the party set, the current session's timing, and the
//! relay's aggregates. Owned by one task; connections talk to it through
//! [`super::HubEvent`]s.

use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::clock::{ClockReconciler, Millis};
use crate::milestone::{MilestoneReport, MilestoneSchedule, PartyStats};
use crate::protocol::{self, Envelope, Message};
use crate::resources::ResourceSample;
use crate::stats::{MetricBook, MetricCategory, MetricSet, MetricsSnapshot};

pub type ConnId = u64;

/// Relay statistics for one sender session, persisted on session end.
#[derive(Debug, Clone, Serialize)]
pub struct RelayReport {
    pub sender: Option<ConnId>,
    pub chunk_count: u64,
    pub total_bytes: u64,
    pub started_wall: Option<Millis>,
    pub ended_wall: Millis,
    /// Relay-clock span from the first to the last chunk
    pub session_duration_ms: Option<Millis>,
    pub peak_parties: usize,
    /// Process-lifetime aggregates at the time the session ended
    pub metrics: MetricsSnapshot,
}

/// Something the hub's owner should persist.
#[derive(Debug)]
pub enum HubOutput {
    Milestone(MilestoneReport),
    SessionEnded(RelayReport),
}

struct Session {
    sender: ConnId,
    started_at: Millis,
    started_wall: Millis,
    last_chunk_at: Millis,
    /// Cumulative nominal duration since the first chunk
    ideal_offset: Millis,
    /// Set once a chunk without pacing info breaks the schedule
    schedule_broken: bool,
    sender_clock: ClockReconciler,
    chunk_count: u64,
    total_bytes: u64,
}

impl Session {
    fn new(sender: ConnId, now: Millis, wall: Millis) -> Self {
        Self {
            sender,
            started_at: now,
            started_wall: wall,
            last_chunk_at: now,
            ideal_offset: 0.0,
            schedule_broken: false,
            sender_clock: ClockReconciler::new(),
            chunk_count: 0,
            total_bytes: 0,
        }
    }
}

pub struct RelayHub {
    peers: HashMap<ConnId, UnboundedSender<Vec<u8>>>,
    book: MetricBook,
    session: Option<Session>,
    milestones: MilestoneSchedule,
    peak_parties: usize,
}

impl RelayHub {
    pub fn new(metrics: MetricSet) -> Self {
        Self {
            peers: HashMap::new(),
            book: MetricBook::new(metrics),
            session: None,
            milestones: MilestoneSchedule::new(std::iter::empty()),
            peak_parties: 0,
        }
    }

    #[cfg(test)]
    pub fn party_count(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub fn book(&self) -> &MetricBook {
        &self.book
    }

    pub fn active_sender(&self) -> Option<ConnId> {
        self.session.as_ref().map(|s| s.sender)
    }

    pub fn record_resources(&mut self, sample: &ResourceSample) {
        sample.record_into(&mut self.book);
    }

    pub fn join(&mut self, id: ConnId, tx: UnboundedSender<Vec<u8>>) {
        self.peers.insert(id, tx);
        self.peak_parties = self.peak_parties.max(self.peers.len());
        tracing::info!(conn = id, parties = self.peers.len(), "party joined");
    }

    pub fn leave(&mut self, id: ConnId) {
        if self.peers.remove(&id).is_none() {
            return;
        }
        if self.active_sender() == Some(id) {
            // The session stays open; only an explicit end closes it
            tracing::warn!(conn = id, "active sender disconnected mid-session");
        }
        tracing::info!(conn = id, parties = self.peers.len(), "party left");
    }

    /// One binary frame from `from`, received at relay monotonic `now`.
    pub fn on_frame(&mut self, from: ConnId, frame: &[u8], now: Millis, wall: Millis) -> Option<HubOutput> {
        let message = match protocol::decode(frame) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(conn = from, error = %e, "undecodable frame dropped");
                return None;
            }
        };

        match message {
            Message::VideoFrame(envelope) => {
                self.on_chunk(from, envelope, now, wall);
                None
            }
            Message::Milestone(report) => self.on_milestone(report, wall).map(HubOutput::Milestone),
            Message::ScreenShareEnded => self.on_session_end(wall).map(HubOutput::SessionEnded),
            other => {
                tracing::debug!(conn = from, kind = other.kind(), "unexpected message, ignored");
                None
            }
        }
    }

    fn on_chunk(&mut self, from: ConnId, mut envelope: Envelope, now: Millis, wall: Millis) {
        let idx = envelope.chunk.idx;
        // A first chunk takes over when it comes from the active sender, or
        // when the active sender is gone without ending its session
        let restart = envelope.first
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.sender == from || !self.peers.contains_key(&s.sender));
        if self.session.is_none() || restart {
            if let Some(previous) = self.session.as_ref().filter(|_| restart) {
                tracing::info!(
                    conn = from,
                    previous = previous.sender,
                    chunks = previous.chunk_count,
                    "new session replaces the open one"
                );
            }
            tracing::info!(conn = from, "session started");
            self.session = Some(Session::new(from, now, wall));
            self.milestones.reset();
        }

        envelope.stamp_relay(now);
        let size = envelope.chunk.size();
        let duration = envelope.chunk.duration_ms;
        let sent_at = envelope.stamps.sent_at;
        let first = envelope.first;

        let frame = match protocol::encode(&Message::VideoFrame(envelope)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(idx, error = %e, "failed to re-encode chunk, dropped");
                return;
            }
        };
        let fanout = self.broadcast(&frame, Some(from));

        let ack = if first {
            Message::FirstFrameAck {
                idx,
                relay_time: Some(now),
            }
        } else {
            Message::AckFrame {
                idx,
                relay_time: Some(now),
            }
        };
        self.send_to(from, &ack);

        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.sender != from {
            // Forwarded like any other chunk, but only the active sender's
            // stream is measured
            tracing::warn!(conn = from, active = session.sender, idx, "chunk from a second sender");
            return;
        }

        session.chunk_count += 1;
        session.total_bytes += size as u64;
        session.last_chunk_at = now;

        match duration {
            Some(d) if !session.schedule_broken => {
                if session.chunk_count > 1 {
                    session.ideal_offset += d;
                }
                let ideal = session.started_at + session.ideal_offset;
                self.book.record(MetricCategory::ServerDelay, now - ideal);
            }
            Some(_) => {}
            None => {
                if !session.schedule_broken {
                    tracing::warn!(idx, "chunk without pacing info, server delay unavailable for the session");
                }
                session.schedule_broken = true;
            }
        }

        if let Some(transit) = session.sender_clock.transit(sent_at, now) {
            self.book.record(MetricCategory::UplinkTransit, transit);
        }

        tracing::trace!(idx, size, fanout, "chunk relayed");
    }

    fn on_milestone(&mut self, report: MilestoneReport, wall: Millis) -> Option<MilestoneReport> {
        if !self.milestones.claim(report.mark_ms) {
            tracing::debug!(mark_ms = report.mark_ms, "duplicate milestone ignored");
            return None;
        }
        let chunk_count = self.session.as_ref().map_or(0, |s| s.chunk_count);
        let merged = report.merge_relay(wall, PartyStats::from_book(chunk_count, &self.book));

        match protocol::encode(&Message::Milestone(merged.clone())) {
            Ok(frame) => {
                self.broadcast(&frame, None);
            }
            Err(e) => tracing::error!(error = %e, "failed to encode milestone"),
        }
        tracing::info!(mark = %merged.label(), chunks = chunk_count, "milestone relayed");
        Some(merged)
    }

    fn on_session_end(&mut self, wall: Millis) -> Option<RelayReport> {
        if let Ok(frame) = protocol::encode(&Message::TransmissionEnded) {
            self.broadcast(&frame, None);
        }
        self.milestones.reset();

        let Some(session) = self.session.take() else {
            tracing::info!("end of stream with no active session");
            return None;
        };
        tracing::info!(
            sender = session.sender,
            chunks = session.chunk_count,
            "session ended, transmission-ended broadcast"
        );
        Some(RelayReport {
            sender: Some(session.sender),
            chunk_count: session.chunk_count,
            total_bytes: session.total_bytes,
            started_wall: Some(session.started_wall),
            ended_wall: wall,
            session_duration_ms: Some(session.last_chunk_at - session.started_at),
            peak_parties: self.peak_parties,
            metrics: self.book.snapshot(),
        })
    }

    /// Send `frame` to every party except `except`. Returns how many got it.
    fn broadcast(&self, frame: &[u8], except: Option<ConnId>) -> usize {
        let mut sent = 0;
        for (id, tx) in &self.peers {
            if Some(*id) != except && tx.send(frame.to_vec()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn send_to(&self, id: ConnId, message: &Message) {
        let Some(tx) = self.peers.get(&id) else {
            return;
        };
        match protocol::encode(message) {
            Ok(frame) => {
                let _ = tx.send(frame);
            }
            Err(e) => tracing::error!(conn = id, error = %e, "failed to encode reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Chunk;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn party(hub: &mut RelayHub, id: ConnId) -> UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = unbounded_channel();
        hub.join(id, tx);
        rx
    }

    fn chunk_frame(idx: u64, duration: Option<f64>, sent_at: f64) -> Vec<u8> {
        let chunk = Chunk {
            idx,
            duration_ms: duration,
            data: vec![idx as u8; 8],
        };
        let envelope = Envelope::new(chunk, sent_at, 1_700_000_000_000.0 + sent_at, idx == 1);
        protocol::encode(&Message::VideoFrame(envelope)).unwrap()
    }

    fn drain(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(protocol::decode(&frame).unwrap());
        }
        out
    }

    fn relayed_indices(messages: &[Message]) -> Vec<u64> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::VideoFrame(env) => Some(env.chunk.idx),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_fanout_excludes_sender_and_preserves_order() {
        let mut hub = RelayHub::new(MetricSet::all());
        let mut a = party(&mut hub, 1);
        let mut b = party(&mut hub, 2);
        let mut c = party(&mut hub, 3);

        for idx in 1..=5 {
            let at = idx as f64 * 150.0;
            hub.on_frame(1, &chunk_frame(idx, Some(150.0), at), at + 10.0, 0.0);
        }

        assert_eq!(relayed_indices(&drain(&mut b)), vec![1, 2, 3, 4, 5]);
        assert_eq!(relayed_indices(&drain(&mut c)), vec![1, 2, 3, 4, 5]);

        let to_sender = drain(&mut a);
        assert!(relayed_indices(&to_sender).is_empty());
        assert_eq!(
            to_sender[0],
            Message::FirstFrameAck {
                idx: 1,
                relay_time: Some(160.0)
            }
        );
        let acks: Vec<u64> = to_sender[1..]
            .iter()
            .map(|m| match m {
                Message::AckFrame { idx, .. } => *idx,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(acks, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_relay_stamp_added_sender_stamps_kept() {
        let mut hub = RelayHub::new(MetricSet::all());
        let _a = party(&mut hub, 1);
        let mut b = party(&mut hub, 2);
        hub.on_frame(1, &chunk_frame(1, Some(0.0), 42.0), 99.0, 0.0);

        let Message::VideoFrame(env) = &drain(&mut b)[0] else {
            panic!("expected video frame");
        };
        assert_eq!(env.stamps.sent_at, Some(42.0));
        assert_eq!(env.stamps.relayed_at, Some(99.0));
        assert_eq!(env.chunk.data, vec![1u8; 8]);
    }

    #[test]
    fn test_server_delay_relative_to_ideal_schedule() {
        let mut hub = RelayHub::new(MetricSet::all());
        let _a = party(&mut hub, 1);
        // Arrivals at 1000, 1150, 1330 (30 late), 1450
        let arrivals = [(1, 0.0, 1000.0), (2, 150.0, 1150.0), (3, 150.0, 1330.0), (4, 150.0, 1450.0)];
        for (idx, dur, at) in arrivals {
            hub.on_frame(1, &chunk_frame(idx, Some(dur), at - 1000.0), at, 0.0);
        }
        let delay = hub.book().get(MetricCategory::ServerDelay).unwrap();
        assert_eq!(delay.count(), 4);
        assert_eq!(delay.max(), Some(30.0));
        assert_eq!(delay.min(), Some(0.0));
        let transit = hub.book().get(MetricCategory::UplinkTransit).unwrap();
        assert_eq!(transit.max(), Some(30.0));
    }

    #[test]
    fn test_missing_pacing_suppresses_server_delay() {
        let mut hub = RelayHub::new(MetricSet::all());
        let _a = party(&mut hub, 1);
        hub.on_frame(1, &chunk_frame(1, None, 0.0), 10.0, 0.0);
        hub.on_frame(1, &chunk_frame(2, Some(150.0), 150.0), 160.0, 0.0);
        assert_eq!(hub.book().count(MetricCategory::ServerDelay), 0);
        assert_eq!(hub.book().count(MetricCategory::UplinkTransit), 2);
    }

    #[test]
    fn test_any_party_may_send() {
        // No "who may send" check: a second party's chunks are forwarded too
        let mut hub = RelayHub::new(MetricSet::all());
        let mut a = party(&mut hub, 1);
        let mut b = party(&mut hub, 2);
        let mut c = party(&mut hub, 3);

        hub.on_frame(1, &chunk_frame(1, Some(0.0), 0.0), 0.0, 0.0);
        hub.on_frame(2, &chunk_frame(7, Some(150.0), 0.0), 5.0, 0.0);

        assert_eq!(relayed_indices(&drain(&mut a)), vec![7]);
        assert_eq!(relayed_indices(&drain(&mut b)), vec![1]);
        assert_eq!(relayed_indices(&drain(&mut c)), vec![1, 7]);
        // The intruding chunk is not part of the measured session
        assert_eq!(hub.active_sender(), Some(1));
        assert_eq!(hub.book().count(MetricCategory::ServerDelay), 1);
    }

    #[test]
    fn test_reconnected_sender_starts_new_session() {
        let mut hub = RelayHub::new(MetricSet::all());
        let _a = party(&mut hub, 1);
        let mut b = party(&mut hub, 2);
        hub.on_frame(1, &chunk_frame(1, Some(0.0), 0.0), 10.0, 0.0);
        let mark = protocol::encode(&Message::Milestone(MilestoneReport::from_sender(
            60_000,
            1_000.0,
            PartyStats::default(),
        )))
        .unwrap();
        assert!(hub.on_frame(1, &mark, 60_010.0, 1_001.0).is_some());

        // Sender drops without ending and comes back on a new connection
        hub.leave(1);
        let _c = party(&mut hub, 3);
        hub.on_frame(3, &chunk_frame(1, Some(0.0), 0.0), 70_000.0, 0.0);
        hub.on_frame(3, &chunk_frame(2, Some(150.0), 150.0), 70_150.0, 0.0);
        assert_eq!(hub.active_sender(), Some(3));
        assert_eq!(hub.book().count(MetricCategory::ServerDelay), 3);
        assert_eq!(relayed_indices(&drain(&mut b)), vec![1, 1, 2]);

        let Some(HubOutput::Milestone(merged)) = hub.on_frame(3, &mark, 130_000.0, 2_000.0) else {
            panic!("new session's first mark must be relayed");
        };
        assert_eq!(merged.relay.as_ref().map(|p| p.chunk_count), Some(2));
    }

    #[test]
    fn test_second_sender_first_chunk_does_not_take_over() {
        let mut hub = RelayHub::new(MetricSet::all());
        let _a = party(&mut hub, 1);
        let _b = party(&mut hub, 2);
        hub.on_frame(1, &chunk_frame(1, Some(0.0), 0.0), 0.0, 0.0);
        hub.on_frame(2, &chunk_frame(1, Some(0.0), 0.0), 5.0, 0.0);
        assert_eq!(hub.active_sender(), Some(1));
    }

    #[test]
    fn test_milestone_merged_and_broadcast_once() {
        let mut hub = RelayHub::new(MetricSet::all());
        let mut a = party(&mut hub, 1);
        let mut b = party(&mut hub, 2);
        hub.on_frame(1, &chunk_frame(1, Some(0.0), 0.0), 1.0, 0.0);
        drain(&mut a);
        drain(&mut b);

        let report = MilestoneReport::from_sender(60_000, 5_000.0, PartyStats::default());
        let frame = protocol::encode(&Message::Milestone(report)).unwrap();
        let Some(HubOutput::Milestone(merged)) = hub.on_frame(1, &frame, 60_001.0, 5_003.0) else {
            panic!("expected milestone output");
        };
        assert_eq!(merged.relay_time, Some(5_003.0));
        assert_eq!(merged.relay.as_ref().map(|p| p.chunk_count), Some(1));

        // Every party gets it, the sender included
        for rx in [&mut a, &mut b] {
            let got = drain(rx);
            assert_eq!(got, vec![Message::Milestone(merged.clone())]);
        }

        assert!(hub.on_frame(1, &frame, 60_002.0, 5_004.0).is_none());
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn test_session_end_broadcasts_to_all_and_resets() {
        let mut hub = RelayHub::new(MetricSet::all());
        let mut a = party(&mut hub, 1);
        let mut b = party(&mut hub, 2);
        for idx in 1..=3 {
            let at = idx as f64 * 150.0;
            hub.on_frame(1, &chunk_frame(idx, Some(150.0), at), at, 1_000.0);
        }
        drain(&mut a);
        drain(&mut b);

        let end = protocol::encode(&Message::ScreenShareEnded).unwrap();
        let Some(HubOutput::SessionEnded(report)) = hub.on_frame(1, &end, 600.0, 2_000.0) else {
            panic!("expected session report");
        };
        assert_eq!(report.chunk_count, 3);
        assert_eq!(report.total_bytes, 24);
        assert_eq!(report.session_duration_ms, Some(300.0));
        assert_eq!(report.ended_wall, 2_000.0);
        assert_eq!(drain(&mut a), vec![Message::TransmissionEnded]);
        assert_eq!(drain(&mut b), vec![Message::TransmissionEnded]);
        assert_eq!(hub.active_sender(), None);

        // A second end has no session to report
        assert!(hub.on_frame(1, &end, 700.0, 2_100.0).is_none());
    }

    #[test]
    fn test_leave_and_garbage_frames() {
        let mut hub = RelayHub::new(MetricSet::all());
        let _a = party(&mut hub, 1);
        let mut b = party(&mut hub, 2);
        hub.leave(2);
        hub.leave(2);
        assert_eq!(hub.party_count(), 1);
        assert!(hub.on_frame(1, &[1, 2], 0.0, 0.0).is_none());
        hub.on_frame(1, &chunk_frame(1, Some(0.0), 0.0), 0.0, 0.0);
        assert!(b.try_recv().is_err());
    }
}
