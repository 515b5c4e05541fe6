//! Haptic pulse shaping.
//!
//! Controller motors cannot render very short pulses, so short pulses are
//! lengthened and boosted in amplitude. The mapping is stateless.

use serde::{Deserialize, Serialize};

use crate::types::HapticCommand;

/// Duration substituted for zero-length pulses.
const ZERO_DURATION_FIX_S: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HapticsConfig {
    /// Shortest pulse the motor renders, in seconds. Default 10 ms.
    pub min_duration_s: f32,
    /// Amplitude boost applied at the shortest pulse. Default 2.5.
    pub low_duration_amplitude_multiplier: f32,
    /// Width of the boosted region as a fraction of `min_duration_s`. Default 0.5.
    pub low_duration_range: f32,
    /// Amplitudes are raised to `1 - amplitude_curve`. Default 0.4.
    pub amplitude_curve: f32,
}

impl Default for HapticsConfig {
    fn default() -> Self {
        Self {
            min_duration_s: 0.01,
            low_duration_amplitude_multiplier: 2.5,
            low_duration_range: 0.5,
            amplitude_curve: 0.4,
        }
    }
}

impl HapticsConfig {
    pub fn validate(&self) -> tether_common::Result<()> {
        use tether_common::Error;

        if !(self.min_duration_s.is_finite() && self.min_duration_s > 0.0) {
            return Err(Error::config("haptics.min_duration_s must be positive"));
        }
        if !(self.low_duration_range > 0.0 && self.low_duration_range <= 1.0) {
            return Err(Error::config("haptics.low_duration_range must be in (0, 1]"));
        }
        if !(self.low_duration_amplitude_multiplier.is_finite()
            && self.low_duration_amplitude_multiplier > 0.0)
        {
            return Err(Error::config(
                "haptics.low_duration_amplitude_multiplier must be positive",
            ));
        }
        if !(self.amplitude_curve >= 0.0 && self.amplitude_curve < 1.0) {
            return Err(Error::config("haptics.amplitude_curve must be in [0, 1)"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HapticShaper {
    config: HapticsConfig,
}

impl HapticShaper {
    pub fn new(config: HapticsConfig) -> tether_common::Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &HapticsConfig {
        &self.config
    }

    pub fn shape(&self, command: &HapticCommand) -> HapticCommand {
        let min = self.config.min_duration_s as f64;
        let range = self.config.low_duration_range as f64;
        let multiplier = self.config.low_duration_amplitude_multiplier as f64;
        let exponent = 1.0 - self.config.amplitude_curve as f64;

        let mut duration = sanitize(command.duration_s).max(0.0);
        if duration == 0.0 {
            duration = ZERO_DURATION_FIX_S;
        }
        duration = duration.max(min * 0.5);

        let amplitude = sanitize(command.amplitude).clamp(0.0, 1.0);
        let offset = duration - 0.5 * min * (1.0 - range);
        let boost = (multiplier - 1.0) * min * range
            / ((min * range).powi(2) * 0.25 / offset + offset)
            + 1.0;
        let amplitude = (amplitude * boost).powf(exponent);

        let duration = min.powi(2) * 0.25 / duration + duration;

        HapticCommand {
            device: command.device,
            duration_s: duration as f32,
            frequency_hz: sanitize(command.frequency_hz).max(0.0) as f32,
            amplitude: sanitize_f64(amplitude).clamp(0.0, 1.0) as f32,
        }
    }
}

fn sanitize(value: f32) -> f64 {
    sanitize_f64(value as f64)
}

fn sanitize_f64(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
