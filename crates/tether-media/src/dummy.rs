use std::time::Instant;

use tracing::{debug, info};

use crate::{
    CaptureSource, EncodeConfig, EncodedFrame, FrameFormat, MediaError, MediaResult, RawFrame,
    Resolution, VideoEncoder,
};

/// Synthetic capture source: a vertical bar that sweeps across the frame.
pub struct TestPatternCapture {
    start: Instant,
    resolution: Resolution,
    seq: u64,
}

impl TestPatternCapture {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            start: Instant::now(),
            resolution,
            seq: 0,
        }
    }
}

impl CaptureSource for TestPatternCapture {
    fn capture_frame(&mut self) -> MediaResult<RawFrame> {
        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        if width == 0 || height == 0 {
            return Err(MediaError::Capture("zero-sized capture target".into()));
        }

        let stride = width * 4;
        let mut bytes = vec![0u8; stride * height];
        let bar = (self.seq as usize * 4) % width;
        for row in bytes.chunks_exact_mut(stride) {
            row[bar * 4..bar * 4 + 4].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        }
        self.seq += 1;

        Ok(RawFrame {
            resolution: self.resolution,
            format: FrameFormat::Rgba8,
            timestamp_ns: self.start.elapsed().as_nanos() as u64,
            stride: stride as u32,
            bytes,
        })
    }
}

/// CPU "encoder" that emits a payload sized to the configured bitrate.
///
/// It does not compress anything. The payload carries a small header and a
/// digest of the frame so the receiver side can be exercised end to end.
pub struct SoftwareEncoder {
    config: Option<EncodeConfig>,
    seq: u64,
}

impl SoftwareEncoder {
    const KEYFRAME_SCALE: u64 = 4;
    const MIN_PAYLOAD: usize = 16;

    pub fn new() -> Self {
        Self {
            config: None,
            seq: 0,
        }
    }

    fn frame_budget_bytes(config: &EncodeConfig, keyframe: bool) -> usize {
        let per_frame = config.bitrate_bps / 8 / config.fps.max(1) as u64;
        let scaled = if keyframe {
            per_frame.saturating_mul(Self::KEYFRAME_SCALE)
        } else {
            per_frame
        };
        (scaled as usize).max(Self::MIN_PAYLOAD)
    }
}

impl Default for SoftwareEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for SoftwareEncoder {
    fn initialize(&mut self, config: &EncodeConfig) -> MediaResult<()> {
        config.validate()?;
        info!(
            "software encoder ready: {}x{} @ {} fps, {} bps",
            config.resolution.width, config.resolution.height, config.fps, config.bitrate_bps
        );
        self.config = Some(*config);
        self.seq = 0;
        Ok(())
    }

    fn encode(&mut self, frame: RawFrame, force_keyframe: bool) -> MediaResult<EncodedFrame> {
        let config = self.config.as_ref().ok_or(MediaError::NotInitialized)?;
        if frame.resolution != config.resolution {
            return Err(MediaError::Encode(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.resolution.width,
                frame.resolution.height,
                config.resolution.width,
                config.resolution.height
            )));
        }

        let keyframe = force_keyframe || self.seq == 0;
        let digest = frame
            .bytes
            .iter()
            .fold(0u32, |acc, b| acc.rotate_left(5) ^ *b as u32);

        let mut data = vec![0u8; Self::frame_budget_bytes(config, keyframe)];
        data[..8].copy_from_slice(&self.seq.to_be_bytes());
        data[8..12].copy_from_slice(&digest.to_be_bytes());
        data[12] = keyframe as u8;
        self.seq += 1;

        Ok(EncodedFrame {
            timestamp_ns: frame.timestamp_ns,
            keyframe,
            data,
        })
    }

    fn set_bitrate(&mut self, bitrate_bps: u64) -> MediaResult<()> {
        let config = self.config.as_mut().ok_or(MediaError::NotInitialized)?;
        if bitrate_bps == 0 {
            return Err(MediaError::InvalidConfig("zero bitrate".into()));
        }
        debug!("software encoder bitrate {} -> {}", config.bitrate_bps, bitrate_bps);
        config.bitrate_bps = bitrate_bps;
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.config.take().is_some() {
            info!("software encoder shut down after {} frames", self.seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Codec;

    const RES: Resolution = Resolution {
        width: 32,
        height: 8,
    };

    fn config(bitrate_bps: u64) -> EncodeConfig {
        EncodeConfig {
            codec: Codec::Hevc,
            resolution: RES,
            fps: 100,
            bitrate_bps,
        }
    }

    #[test]
    fn test_capture_produces_full_frames() {
        let mut capture = TestPatternCapture::new(RES);
        let a = capture.capture_frame().unwrap();
        let b = capture.capture_frame().unwrap();
        assert_eq!(a.bytes.len(), 32 * 8 * 4);
        assert_ne!(a.bytes, b.bytes);
        assert!(b.timestamp_ns >= a.timestamp_ns);
    }

    #[test]
    fn test_encode_requires_initialize() {
        let mut capture = TestPatternCapture::new(RES);
        let mut encoder = SoftwareEncoder::new();
        let frame = capture.capture_frame().unwrap();
        assert!(matches!(
            encoder.encode(frame, false),
            Err(MediaError::NotInitialized)
        ));
    }

    #[test]
    fn test_first_frame_and_forced_frames_are_keyframes() {
        let mut capture = TestPatternCapture::new(RES);
        let mut encoder = SoftwareEncoder::new();
        encoder.initialize(&config(8_000_000)).unwrap();

        let first = encoder.encode(capture.capture_frame().unwrap(), false).unwrap();
        let second = encoder.encode(capture.capture_frame().unwrap(), false).unwrap();
        let forced = encoder.encode(capture.capture_frame().unwrap(), true).unwrap();
        assert!(first.keyframe);
        assert!(!second.keyframe);
        assert!(forced.keyframe);
        // 8 Mbps at 100 fps is 10 kB per frame, keyframes 4x.
        assert_eq!(second.data.len(), 10_000);
        assert_eq!(forced.data.len(), 40_000);
    }

    #[test]
    fn test_set_bitrate_changes_frame_size() {
        let mut capture = TestPatternCapture::new(RES);
        let mut encoder = SoftwareEncoder::new();
        encoder.initialize(&config(8_000_000)).unwrap();
        encoder.encode(capture.capture_frame().unwrap(), false).unwrap();

        encoder.set_bitrate(4_000_000).unwrap();
        let frame = encoder.encode(capture.capture_frame().unwrap(), false).unwrap();
        assert_eq!(frame.data.len(), 5_000);
    }

    #[test]
    fn test_resolution_mismatch_is_encode_error() {
        let mut capture = TestPatternCapture::new(Resolution {
            width: 16,
            height: 16,
        });
        let mut encoder = SoftwareEncoder::new();
        encoder.initialize(&config(8_000_000)).unwrap();
        assert!(matches!(
            encoder.encode(capture.capture_frame().unwrap(), false),
            Err(MediaError::Encode(_))
        ));
    }
}
