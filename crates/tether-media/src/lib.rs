#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod dummy;
pub use dummy::{SoftwareEncoder, TestPatternCapture};

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("encoder not initialized")]
    NotInitialized,
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("invalid encode config: {0}")]
    InvalidConfig(String),
}

pub type MediaResult<T> = std::result::Result<T, MediaError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Av1,
    Hevc,
    H264,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Rgba8,
    Nv12,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

impl Resolution {
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// A captured side-by-side stereo frame in CPU memory.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub resolution: Resolution,
    pub format: FrameFormat,
    pub timestamp_ns: u64,
    pub stride: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub timestamp_ns: u64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeConfig {
    pub codec: Codec,
    pub resolution: Resolution,
    pub fps: u16,
    pub bitrate_bps: u64,
}

impl EncodeConfig {
    pub fn validate(&self) -> MediaResult<()> {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(MediaError::InvalidConfig("zero resolution".into()));
        }
        if self.fps == 0 {
            return Err(MediaError::InvalidConfig("zero fps".into()));
        }
        if self.bitrate_bps == 0 {
            return Err(MediaError::InvalidConfig("zero bitrate".into()));
        }
        Ok(())
    }
}

pub trait CaptureSource: Send {
    fn capture_frame(&mut self) -> MediaResult<RawFrame>;
}

pub trait VideoEncoder: Send {
    fn initialize(&mut self, config: &EncodeConfig) -> MediaResult<()>;
    fn encode(&mut self, frame: RawFrame, force_keyframe: bool) -> MediaResult<EncodedFrame>;
    fn set_bitrate(&mut self, bitrate_bps: u64) -> MediaResult<()>;
    fn shutdown(&mut self);
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    #[default]
    Software,
    Nvenc,
    Amf,
}

pub fn create_encoder(kind: EncoderKind) -> Box<dyn VideoEncoder> {
    match kind {
        EncoderKind::Software => Box::new(SoftwareEncoder::new()),
        EncoderKind::Nvenc => Box::new(HardwareEncoder::new("nvenc")),
        EncoderKind::Amf => Box::new(HardwareEncoder::new("amf")),
    }
}

/// Placeholder for vendor encoders that are linked in by platform builds.
struct HardwareEncoder {
    name: &'static str,
}

impl HardwareEncoder {
    fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl VideoEncoder for HardwareEncoder {
    fn initialize(&mut self, _config: &EncodeConfig) -> MediaResult<()> {
        Err(MediaError::Unavailable(format!(
            "{} encoder is not built into this binary",
            self.name
        )))
    }

    fn encode(&mut self, _frame: RawFrame, _force_keyframe: bool) -> MediaResult<EncodedFrame> {
        Err(MediaError::NotInitialized)
    }

    fn set_bitrate(&mut self, _bitrate_bps: u64) -> MediaResult<()> {
        Err(MediaError::NotInitialized)
    }

    fn shutdown(&mut self) {}
}
