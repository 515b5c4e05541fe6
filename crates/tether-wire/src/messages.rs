//! Messages exchanged between the host and the headset.

use serde::{Deserialize, Serialize};

/// Logical channel a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Control,
    Input,
    Media,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Control(ControlMessage),
    Tracking(TrackingMessage),
    Video(VideoChunk),
    Fec(FecPacket),
    Haptics(HapticsMessage),
}

impl Message {
    pub fn channel(&self) -> Channel {
        match self {
            Message::Control(_) => Channel::Control,
            Message::Tracking(_) | Message::Haptics(_) => Channel::Input,
            Message::Video(_) | Message::Fec(_) => Channel::Media,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Latency probe, echoed back verbatim as `Pong`. `sent_ns` is in the
    /// sender's clock; the host derives the client clock offset from it.
    Ping { probe_id: u64, sent_ns: u64 },
    Pong { probe_id: u64, sent_ns: u64 },
    /// The headset finished reassembling (and decoding) a frame.
    FrameAck { frame_index: u64 },
    /// The headset could not rebuild a frame from data + parity.
    FecFailure { frame_index: Option<u64> },
    RequestKeyframe,
    /// Latency measured by the headset on its own clock.
    NetworkLatency { latency_us: u64 },
    Battery {
        device_path: u64,
        gauge: f32,
        is_plugged: bool,
    },
    BitrateRequest {
        bitrate_bps: u64,
        adaptive: bool,
        max_bitrate_bps: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceMotion {
    pub device_path: u64,
    pub position: [f64; 3],
    /// Quaternion as `[x, y, z, w]`.
    pub orientation: [f64; 4],
    pub linear_velocity: [f64; 3],
    pub angular_velocity: [f64; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ButtonValue {
    Binary(bool),
    Scalar(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ButtonEntry {
    pub path: u64,
    pub value: ButtonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingMessage {
    /// Client clock. Mapped onto host time with the offset learned from
    /// client pings.
    pub target_timestamp_ns: u64,
    pub motions: Vec<DeviceMotion>,
    pub buttons: Vec<ButtonEntry>,
}

/// One slice of an encoded frame. `chunk_index`/`chunk_count` are the frame
/// boundary markers the receiver reassembles by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoChunk {
    pub frame_index: u64,
    pub chunk_index: u32,
    pub chunk_count: u32,
    pub presentation_ts_ns: u64,
    pub keyframe: bool,
    pub encode_us: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecPacket {
    pub group_id: u64,
    pub first_packet_id: u64,
    pub shard_count: u32,
    pub parity_index: u32,
    pub payload: Vec<u8>,
    pub shard_lengths: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HapticsMessage {
    pub device_path: u64,
    pub duration_s: f32,
    pub frequency_hz: f32,
    pub amplitude: f32,
}
