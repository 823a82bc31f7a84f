use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Millis;
use crate::milestone::MilestoneReport;

/// Largest header we accept; anything bigger is a corrupt length prefix.
const MAX_HEADER_LEN: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),
    #[error("header length {0} out of range")]
    BadHeaderLength(usize),
    #[error("header encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("header decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// One encoded media segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Sequence index, monotonic per sender session
    pub idx: u64,
    /// Time since the previous chunk was produced; 0 for the first,
    /// `None` when the producer sent no pacing info
    pub duration_ms: Option<Millis>,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Timestamps gathered hop by hop. Each hop writes only its own field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stamps {
    /// Sender monotonic clock at production
    pub sent_at: Option<Millis>,
    /// Sender wall clock at production
    pub sent_wall: Option<Millis>,
    /// Relay monotonic clock at receipt
    pub relayed_at: Option<Millis>,
}

/// A chunk plus its per-hop metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub chunk: Chunk,
    pub stamps: Stamps,
    /// First chunk of a sender session; the relay answers it with a
    /// first-frame ack
    pub first: bool,
}

impl Envelope {
    pub fn new(chunk: Chunk, sent_at: Millis, sent_wall: Millis, first: bool) -> Self {
        Self {
            chunk,
            stamps: Stamps {
                sent_at: Some(sent_at),
                sent_wall: Some(sent_wall),
                relayed_at: None,
            },
            first,
        }
    }

    /// Relay-side stamp. Sender stamps are left untouched.
    pub fn stamp_relay(&mut self, relayed_at: Millis) {
        self.stamps.relayed_at = Some(relayed_at);
    }
}

/// Message types sent over the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Media chunk: sender → relay → receivers
    VideoFrame(Envelope),
    /// Relay → sender receipt for every chunk
    AckFrame { idx: u64, relay_time: Option<Millis> },
    /// Relay → sender receipt for the first chunk of a session
    FirstFrameAck { idx: u64, relay_time: Option<Millis> },
    /// Periodic statistics rollup, broadcast in every direction
    Milestone(MilestoneReport),
    /// Sender → relay end of stream
    ScreenShareEnded,
    /// Relay → everyone end of stream
    TransmissionEnded,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::VideoFrame(_) => "video-frame",
            Message::AckFrame { .. } => "ack-frame",
            Message::FirstFrameAck { .. } => "first-frame-ack",
            Message::Milestone(_) => "milestone",
            Message::ScreenShareEnded => "screen-share-ended",
            Message::TransmissionEnded => "transmission-ended",
        }
    }
}

/// Header as it appears on the wire. Every timing field is optional so
/// peers with fewer fields still interoperate; a missing field decodes as
/// `None`, never as zero.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum WireHeader {
    VideoFrame {
        idx: u64,
        #[serde(default)]
        dur: Option<f64>,
        #[serde(default, rename = "tSend")]
        t_send: Option<f64>,
        #[serde(default, rename = "tAbs")]
        t_abs: Option<f64>,
        #[serde(default, rename = "tRel")]
        t_rel: Option<f64>,
        #[serde(default, rename = "isFirst")]
        is_first: bool,
    },
    AckFrame {
        idx: u64,
        #[serde(default, rename = "relayTime")]
        relay_time: Option<f64>,
    },
    FirstFrameAck {
        idx: u64,
        #[serde(default, rename = "relayTime")]
        relay_time: Option<f64>,
    },
    Milestone {
        report: MilestoneReport,
    },
    ScreenShareEnded,
    TransmissionEnded,
}

/// Frame layout: `u32` little-endian header length, MessagePack header
/// (named fields), then the raw chunk bytes for `video-frame`.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let (header, payload): (WireHeader, &[u8]) = match message {
        Message::VideoFrame(env) => (
            WireHeader::VideoFrame {
                idx: env.chunk.idx,
                dur: env.chunk.duration_ms,
                t_send: env.stamps.sent_at,
                t_abs: env.stamps.sent_wall,
                t_rel: env.stamps.relayed_at,
                is_first: env.first,
            },
            env.chunk.data.as_slice(),
        ),
        Message::AckFrame { idx, relay_time } => (
            WireHeader::AckFrame {
                idx: *idx,
                relay_time: *relay_time,
            },
            &[],
        ),
        Message::FirstFrameAck { idx, relay_time } => (
            WireHeader::FirstFrameAck {
                idx: *idx,
                relay_time: *relay_time,
            },
            &[],
        ),
        Message::Milestone(report) => (
            WireHeader::Milestone {
                report: report.clone(),
            },
            &[],
        ),
        Message::ScreenShareEnded => (WireHeader::ScreenShareEnded, &[]),
        Message::TransmissionEnded => (WireHeader::TransmissionEnded, &[]),
    };

    let header = rmp_serde::to_vec_named(&header)?;
    let mut frame = Vec::with_capacity(4 + header.len() + payload.len());
    frame.extend_from_slice(&(header.len() as u32).to_le_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a frame into header bytes and payload without interpreting the
/// header.
fn split_frame(frame: &[u8]) -> Result<(&[u8], &[u8]), ProtocolError> {
    if frame.len() < 4 {
        return Err(ProtocolError::Truncated(frame.len()));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&frame[..4]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    if header_len > MAX_HEADER_LEN || 4 + header_len > frame.len() {
        return Err(ProtocolError::BadHeaderLength(header_len));
    }
    Ok((&frame[4..4 + header_len], &frame[4 + header_len..]))
}

/// Raw chunk bytes of a frame, whatever its header says.
pub fn payload(frame: &[u8]) -> Result<&[u8], ProtocolError> {
    split_frame(frame).map(|(_, payload)| payload)
}

pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    let (header, payload) = split_frame(frame)?;
    let header: WireHeader = rmp_serde::from_slice(header)?;
    Ok(match header {
        WireHeader::VideoFrame {
            idx,
            dur,
            t_send,
            t_abs,
            t_rel,
            is_first,
        } => Message::VideoFrame(Envelope {
            chunk: Chunk {
                idx,
                duration_ms: dur,
                data: payload.to_vec(),
            },
            stamps: Stamps {
                sent_at: t_send,
                sent_wall: t_abs,
                relayed_at: t_rel,
            },
            first: is_first,
        }),
        WireHeader::AckFrame { idx, relay_time } => Message::AckFrame { idx, relay_time },
        WireHeader::FirstFrameAck { idx, relay_time } => {
            Message::FirstFrameAck { idx, relay_time }
        }
        WireHeader::Milestone { report } => Message::Milestone(report),
        WireHeader::ScreenShareEnded => Message::ScreenShareEnded,
        WireHeader::TransmissionEnded => Message::TransmissionEnded,
    })
}
