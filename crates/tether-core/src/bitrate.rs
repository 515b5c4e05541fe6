use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitrateMode {
    /// Operator constant.
    Fixed,
    /// AIMD closed loop on latency and loss.
    Adaptive,
}

/// Configuration for the bitrate controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateConfig {
    pub mode: BitrateMode,
    /// Starting bitrate and, in fixed mode, the operator constant.
    pub initial_bitrate_bps: u64,
    pub min_bitrate_bps: u64,
    /// Operator maximum.
    pub max_bitrate_bps: u64,
    /// EWMA alpha for round-trip latency. Default 0.125.
    pub latency_alpha: f64,
    /// EWMA alpha for the loss rate. Default 0.1.
    pub loss_alpha: f64,
    /// EWMA alpha for encode + transmit time. Default 0.1.
    pub frame_time_alpha: f64,
    /// Below this smoothed RTT the controller may increase. Default 15 ms.
    pub latency_low_water_us: u64,
    /// Above this smoothed RTT the controller decreases. Default 40 ms.
    pub latency_high_water_us: u64,
    /// Additive increase per clean window. Default 2 Mbps.
    pub increase_step_bps: u64,
    /// Multiplicative decrease factor (beta). Default 0.85.
    pub decrease_factor: f64,
    /// Clean frames required before an increase. Default 30.
    pub window_frames: u32,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            mode: BitrateMode::Adaptive,
            initial_bitrate_bps: 30_000_000,
            min_bitrate_bps: 5_000_000,
            max_bitrate_bps: 100_000_000,
            latency_alpha: 0.125,
            loss_alpha: 0.1,
            frame_time_alpha: 0.1,
            latency_low_water_us: 15_000,
            latency_high_water_us: 40_000,
            increase_step_bps: 2_000_000,
            decrease_factor: 0.85,
            window_frames: 30,
        }
    }
}

impl BitrateConfig {
    pub fn validate(&self) -> tether_common::Result<()> {
        use tether_common::Error;

        if self.min_bitrate_bps == 0 {
            return Err(Error::config("bitrate.min_bitrate_bps must be positive"));
        }
        if self.min_bitrate_bps > self.max_bitrate_bps {
            return Err(Error::config(format!(
                "bitrate.min_bitrate_bps ({}) exceeds max_bitrate_bps ({})",
                self.min_bitrate_bps, self.max_bitrate_bps
            )));
        }
        for (name, alpha) in [
            ("latency_alpha", self.latency_alpha),
            ("loss_alpha", self.loss_alpha),
            ("frame_time_alpha", self.frame_time_alpha),
        ] {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(Error::config(format!("bitrate.{name} must be in (0, 1]")));
            }
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return Err(Error::config("bitrate.decrease_factor must be in (0, 1)"));
        }
        if self.latency_low_water_us > self.latency_high_water_us {
            return Err(Error::config(
                "bitrate.latency_low_water_us exceeds latency_high_water_us",
            ));
        }
        if self.window_frames == 0 {
            return Err(Error::config("bitrate.window_frames must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitrateTrend {
    Increasing,
    Holding,
    Decreasing,
}

/// Snapshot published after every feedback event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitrateState {
    pub current_bitrate_bps: u64,
    pub min_frame_interval_ns: u64,
    pub adaptive: bool,
    pub max_bitrate_bps: u64,
    pub latency_ema_ns: f64,
    pub loss_rate_ema: f64,
    pub trend: BitrateTrend,
}

pub type SharedBitrate = Arc<RwLock<BitrateState>>;

pub fn read_bitrate(shared: &SharedBitrate) -> BitrateState {
    match shared.read() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

/// Per-frame network feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFeedback {
    pub frame_index: u64,
    pub encode_time_ns: u64,
    pub transmit_time_ns: u64,
    pub ack_round_trip_ns: Option<u64>,
    pub was_lost: bool,
}

/// AIMD bitrate controller. Sole writer of [`BitrateState`].
pub struct BitrateController {
    config: BitrateConfig,
    refresh_interval_ns: u64,
    shared: SharedBitrate,

    mode: BitrateMode,
    current_bitrate_bps: u64,
    max_bitrate_bps: u64,

    // `None` until the first sample.
    latency_ema_ns: Option<f64>,
    loss_rate_ema: f64,
    frame_time_ema_ns: Option<f64>,

    clean_frames: u32,
    frames_since_decrease: u32,
    trend: BitrateTrend,
}

impl BitrateController {
    pub fn new(config: BitrateConfig, refresh_hz: f32) -> Self {
        let refresh_interval_ns = if refresh_hz > 0.0 {
            (1e9 / refresh_hz as f64) as u64
        } else {
            0
        };
        let max_bitrate_bps = config.max_bitrate_bps.max(config.min_bitrate_bps);
        let current_bitrate_bps = config
            .initial_bitrate_bps
            .clamp(config.min_bitrate_bps, max_bitrate_bps);
        let mode = config.mode;
        let initial = BitrateState {
            current_bitrate_bps,
            min_frame_interval_ns: refresh_interval_ns,
            adaptive: mode == BitrateMode::Adaptive,
            max_bitrate_bps,
            latency_ema_ns: 0.0,
            loss_rate_ema: 0.0,
            trend: BitrateTrend::Holding,
        };
        Self {
            config,
            refresh_interval_ns,
            shared: Arc::new(RwLock::new(initial)),
            mode,
            current_bitrate_bps,
            max_bitrate_bps,
            latency_ema_ns: None,
            loss_rate_ema: 0.0,
            frame_time_ema_ns: None,
            clean_frames: 0,
            frames_since_decrease: 0,
            trend: BitrateTrend::Holding,
        }
    }

    /// Handle for readers (the encode pipeline).
    pub fn shared(&self) -> SharedBitrate {
        Arc::clone(&self.shared)
    }

    pub fn state(&self) -> BitrateState {
        BitrateState {
            current_bitrate_bps: self.current_bitrate_bps,
            min_frame_interval_ns: self.frame_interval_ns(),
            adaptive: self.mode == BitrateMode::Adaptive,
            max_bitrate_bps: self.max_bitrate_bps,
            latency_ema_ns: self.latency_ema_ns.unwrap_or(0.0),
            loss_rate_ema: self.loss_rate_ema,
            trend: self.trend,
        }
    }

    pub fn on_frame_feedback(&mut self, feedback: FrameFeedback) {
        if !feedback.was_lost {
            let frame_time = feedback
                .encode_time_ns
                .saturating_add(feedback.transmit_time_ns) as f64;
            self.frame_time_ema_ns = Some(ewma(
                self.frame_time_ema_ns,
                frame_time,
                self.config.frame_time_alpha,
            ));
        }
        if let Some(rtt) = feedback.ack_round_trip_ns {
            self.update_latency(rtt);
        }
        self.update_loss(feedback.was_lost);
        self.adjust(feedback.was_lost);
        self.publish();
    }

    /// Round-trip sample outside of frame acks (probe echo or client report).
    pub fn on_latency_sample(&mut self, rtt_ns: u64) {
        self.update_latency(rtt_ns);
        self.publish();
    }

    /// The client could not reconstruct a frame.
    pub fn on_fec_failure(&mut self) {
        self.on_loss_signal();
    }

    /// A frame or event was dropped for lack of resources.
    pub fn on_frame_dropped(&mut self) {
        self.on_loss_signal();
    }

    /// Operator command: switch mode and bounds at runtime.
    pub fn set_parameters(&mut self, bitrate_bps: u64, adaptive: bool, max_bitrate_bps: u64) {
        self.mode = if adaptive {
            BitrateMode::Adaptive
        } else {
            BitrateMode::Fixed
        };
        self.max_bitrate_bps = max_bitrate_bps.max(self.config.min_bitrate_bps);
        self.current_bitrate_bps = bitrate_bps.clamp(self.config.min_bitrate_bps, self.max_bitrate_bps);
        self.clean_frames = 0;
        info!(
            "bitrate parameters set: {} bps ({:?}), max {} bps",
            self.current_bitrate_bps, self.mode, self.max_bitrate_bps
        );
        self.set_trend(BitrateTrend::Holding);
        self.publish();
    }

    fn on_loss_signal(&mut self) {
        self.update_loss(true);
        self.adjust(true);
        self.publish();
    }

    fn update_latency(&mut self, rtt_ns: u64) {
        self.latency_ema_ns = Some(ewma(
            self.latency_ema_ns,
            rtt_ns as f64,
            self.config.latency_alpha,
        ));
    }

    fn update_loss(&mut self, lost: bool) {
        let sample = if lost { 1.0 } else { 0.0 };
        self.loss_rate_ema = (1.0 - self.config.loss_alpha) * self.loss_rate_ema
            + self.config.loss_alpha * sample;
    }

    fn adjust(&mut self, lost: bool) {
        self.frames_since_decrease = self.frames_since_decrease.saturating_add(1);
        if self.mode == BitrateMode::Fixed {
            return;
        }

        let latency_us = self.latency_ema_ns.unwrap_or(0.0) / 1_000.0;
        let congested = latency_us > self.config.latency_high_water_us as f64;

        if lost {
            self.decrease();
        } else if congested {
            // Latency reacts slowly; back off at most once per window.
            if self.frames_since_decrease >= self.config.window_frames {
                self.decrease();
            }
            self.clean_frames = 0;
        } else {
            self.clean_frames += 1;
            if self.clean_frames >= self.config.window_frames {
                self.clean_frames = 0;
                if latency_us < self.config.latency_low_water_us as f64 {
                    self.increase();
                } else {
                    self.set_trend(BitrateTrend::Holding);
                }
            }
        }
    }

    fn increase(&mut self) {
        let next = self
            .current_bitrate_bps
            .saturating_add(self.config.increase_step_bps)
            .min(self.max_bitrate_bps);
        if next > self.current_bitrate_bps {
            debug!("bitrate +{} -> {} bps", next - self.current_bitrate_bps, next);
            self.current_bitrate_bps = next;
            self.set_trend(BitrateTrend::Increasing);
        } else {
            self.set_trend(BitrateTrend::Holding);
        }
    }

    fn decrease(&mut self) {
        let next = ((self.current_bitrate_bps as f64 * self.config.decrease_factor).round() as u64)
            .max(self.config.min_bitrate_bps);
        debug!("bitrate {} -> {} bps", self.current_bitrate_bps, next);
        self.current_bitrate_bps = next;
        self.clean_frames = 0;
        self.frames_since_decrease = 0;
        self.set_trend(BitrateTrend::Decreasing);
    }

    fn set_trend(&mut self, trend: BitrateTrend) {
        if trend != self.trend {
            info!(
                "bitrate trend {:?} -> {:?} at {} bps (rtt {:.1} ms, loss {:.1}%)",
                self.trend,
                trend,
                self.current_bitrate_bps,
                self.latency_ema_ns.unwrap_or(0.0) / 1e6,
                self.loss_rate_ema * 100.0
            );
            self.trend = trend;
        }
    }

    fn frame_interval_ns(&self) -> u64 {
        self.refresh_interval_ns
            .max(self.frame_time_ema_ns.unwrap_or(0.0) as u64)
    }

    fn publish(&self) {
        let state = self.state();
        match self.shared.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

fn ewma(current: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match current {
        Some(current) => (1.0 - alpha) * current + alpha * sample,
        None => sample,
    }
}
