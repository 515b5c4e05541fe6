//! Session configuration.
//!
//! Every component owns its own `serde` config struct; `StreamerConfig`
//! gathers them into the shape of the settings file.

use serde::{Deserialize, Serialize};

use tether_common::{Error, Result};
use tether_media::{Codec, EncodeConfig, EncoderKind, Resolution};

use crate::bitrate::BitrateConfig;
use crate::haptics::HapticsConfig;
use crate::network::NetworkConfig;
use crate::pipeline::PipelineConfig;
use crate::pose_history::PoseConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub codec: Codec,
    pub encoder: EncoderKind,
    /// Render resolution of the side-by-side stereo frame.
    pub width: u16,
    pub height: u16,
    pub refresh_hz: f32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Hevc,
            encoder: EncoderKind::Software,
            width: 2880,
            height: 1600,
            refresh_hz: 90.0,
        }
    }
}

impl VideoConfig {
    pub fn encode_config(&self, bitrate_bps: u64) -> EncodeConfig {
        EncodeConfig {
            codec: self.codec,
            resolution: Resolution {
                width: self.width,
                height: self.height,
            },
            fps: self.refresh_hz.round().clamp(1.0, u16::MAX as f32) as u16,
            bitrate_bps,
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.refresh_hz.is_finite() && self.refresh_hz > 0.0) {
            return Err(Error::config("video.refresh_hz must be positive"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::config("video.width and video.height must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub video: VideoConfig,
    pub bitrate: BitrateConfig,
    pub haptics: HapticsConfig,
    pub pose: PoseConfig,
    pub network: NetworkConfig,
    pub pipeline: PipelineConfig,
    /// Generic trackers registered besides head and hands.
    pub trackers: u32,
    /// Period of the tracking-ingest loop.
    pub ingest_tick_ms: u64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            bitrate: BitrateConfig::default(),
            haptics: HapticsConfig::default(),
            pose: PoseConfig::default(),
            network: NetworkConfig::default(),
            pipeline: PipelineConfig::default(),
            trackers: 0,
            ingest_tick_ms: 2,
        }
    }
}

impl StreamerConfig {
    pub fn validate(&self) -> Result<()> {
        self.video.validate()?;
        self.bitrate.validate()?;
        self.haptics.validate()?;
        self.pose.validate()?;
        self.network.validate()?;
        if self.ingest_tick_ms == 0 {
            return Err(Error::config("ingest_tick_ms must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(StreamerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_refresh_rejected() {
        let mut config = StreamerConfig::default();
        config.video.refresh_hz = 0.0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: StreamerConfig = serde_json::from_str(
            r#"{
                "video": { "encoder": "nvenc", "refresh_hz": 120.0 },
                "bitrate": { "mode": "fixed", "initial_bitrate_bps": 50000000 },
                "haptics": { "amplitude_curve": 0.2 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.video.encoder, EncoderKind::Nvenc);
        assert_eq!(config.video.width, 2880);
        assert_eq!(config.bitrate.initial_bitrate_bps, 50_000_000);
        assert_eq!(config.bitrate.min_bitrate_bps, 5_000_000);
        assert_eq!(config.haptics.min_duration_s, 0.01);
        assert_eq!(config.video.encode_config(1).fps, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_nested_config_rejected() {
        let mut config = StreamerConfig::default();
        config.haptics.low_duration_range = 2.0;
        assert!(config.validate().is_err());

        let mut config = StreamerConfig::default();
        config.network.fec_group_size = 1;
        assert!(config.validate().is_err());
    }
}
