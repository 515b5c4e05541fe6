//! Timestamped head-pose history with interpolation and short-horizon
//! extrapolation.

use std::collections::VecDeque;

use glam::DQuat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{DeviceId, Pose, PoseSample, PredictedPose};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
    /// Number of samples kept. Default 360 (about 4 s at 90 Hz).
    pub history_capacity: usize,
    /// Extrapolation horizon cap in nanoseconds. Default 100 ms.
    pub max_extrapolation_ns: u64,
    /// Added to controller pose timestamps before they are reported.
    pub controller_pose_time_offset_ns: i64,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            history_capacity: 360,
            max_extrapolation_ns: 100_000_000,
            controller_pose_time_offset_ns: 0,
        }
    }
}

impl PoseConfig {
    pub fn validate(&self) -> tether_common::Result<()> {
        if self.history_capacity < 2 {
            return Err(tether_common::Error::config(
                "pose.history_capacity must be at least 2",
            ));
        }
        Ok(())
    }
}

pub struct PoseHistory {
    device: DeviceId,
    capacity: usize,
    max_extrapolation_ns: u64,
    samples: VecDeque<PoseSample>,
}

impl PoseHistory {
    pub fn new(device: DeviceId, config: &PoseConfig) -> Self {
        let capacity = config.history_capacity.max(2);
        Self {
            device,
            capacity,
            max_extrapolation_ns: config.max_extrapolation_ns,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Store a pose. Returns `false` (and leaves the history untouched) when
    /// the timestamp is not newer than the latest sample or the pose is
    /// malformed.
    pub fn record(&mut self, timestamp_ns: u64, pose: Pose) -> bool {
        self.record_sample(PoseSample {
            device: self.device,
            timestamp_ns,
            pose,
            valid: true,
        })
    }

    pub fn record_sample(&mut self, sample: PoseSample) -> bool {
        if !sample.valid || !sample.pose.is_finite() {
            debug!("dropping invalid {} pose @ {}", sample.device, sample.timestamp_ns);
            return false;
        }
        if let Some(latest) = self.samples.back() {
            if sample.timestamp_ns <= latest.timestamp_ns {
                debug!(
                    "dropping out-of-order {} pose: {} <= {}",
                    sample.device, sample.timestamp_ns, latest.timestamp_ns
                );
                return false;
            }
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        true
    }

    pub fn predict(&self, target_ns: u64) -> PredictedPose {
        let len = self.samples.len();
        if len == 0 {
            return PredictedPose {
                pose: Pose::IDENTITY,
                timestamp_ns: target_ns,
                stale: true,
            };
        }

        let idx = self.samples.partition_point(|s| s.timestamp_ns < target_ns);
        if idx < len && self.samples[idx].timestamp_ns == target_ns {
            return self.known(&self.samples[idx], false);
        }
        if idx == 0 {
            return self.known(&self.samples[0], true);
        }
        if idx == len {
            return self.extrapolate(target_ns);
        }

        let before = &self.samples[idx - 1];
        let after = &self.samples[idx];
        let t = (target_ns - before.timestamp_ns) as f64
            / (after.timestamp_ns - before.timestamp_ns) as f64;
        PredictedPose {
            pose: Pose {
                position: before.pose.position.lerp(after.pose.position, t),
                orientation: before.pose.orientation.slerp(after.pose.orientation, t),
            },
            timestamp_ns: target_ns,
            stale: false,
        }
    }

    fn known(&self, sample: &PoseSample, stale: bool) -> PredictedPose {
        PredictedPose {
            pose: sample.pose,
            timestamp_ns: sample.timestamp_ns,
            stale,
        }
    }

    fn extrapolate(&self, target_ns: u64) -> PredictedPose {
        let len = self.samples.len();
        let last = &self.samples[len - 1];
        if len == 1 {
            return self.known(last, false);
        }
        let prev = &self.samples[len - 2];

        let ahead = target_ns - last.timestamp_ns;
        let capped = ahead > self.max_extrapolation_ns;
        let horizon = ahead.min(self.max_extrapolation_ns);
        let t = horizon as f64 / (last.timestamp_ns - prev.timestamp_ns) as f64;

        let velocity = last.pose.position - prev.pose.position;
        let position = last.pose.position + velocity * t;

        let mut delta = last.pose.orientation * prev.pose.orientation.inverse();
        if delta.w < 0.0 {
            delta = -delta;
        }
        let (axis, angle) = delta.to_axis_angle();
        let orientation = if angle.abs() < 1e-9 {
            last.pose.orientation
        } else {
            (DQuat::from_axis_angle(axis, angle * t) * last.pose.orientation).normalize()
        };

        PredictedPose {
            pose: Pose {
                position,
                orientation,
            },
            timestamp_ns: last.timestamp_ns + horizon,
            stale: capped,
        }
    }

    pub fn latest(&self) -> Option<&PoseSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;
    use std::f64::consts::FRAC_PI_2;

    const MS: u64 = 1_000_000;

    fn history() -> PoseHistory {
        PoseHistory::new(DeviceId::Head, &PoseConfig::default())
    }

    fn at(x: f64) -> Pose {
        Pose::new(DVec3::new(x, 0.0, 0.0), DQuat::IDENTITY)
    }

    fn yaw(angle: f64) -> Pose {
        Pose::new(DVec3::ZERO, DQuat::from_rotation_y(angle))
    }

    fn close(a: DVec3, b: DVec3) -> bool {
        (a - b).length() < 1e-9
    }

    #[test]
    fn test_rejects_out_of_order_and_duplicate() {
        let mut h = history();
        assert!(h.record(10 * MS, at(1.0)));
        assert!(!h.record(10 * MS, at(2.0)));
        assert!(!h.record(5 * MS, at(3.0)));
        assert_eq!(h.len(), 1);
        assert_eq!(h.latest().unwrap().pose, at(1.0));
    }

    #[test]
    fn test_rejects_non_finite_pose() {
        let mut h = history();
        assert!(!h.record(MS, at(f64::NAN)));
        assert!(h.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let config = PoseConfig {
            history_capacity: 3,
            ..PoseConfig::default()
        };
        let mut h = PoseHistory::new(DeviceId::Head, &config);
        for i in 1..=5u64 {
            assert!(h.record(i * MS, at(i as f64)));
        }
        assert_eq!(h.len(), 3);
        // Sample 1 was evicted; asking for it returns the oldest kept, stale.
        let p = h.predict(MS);
        assert!(p.stale);
        assert_eq!(p.pose, at(3.0));
    }

    #[test]
    fn test_empty_history_returns_stale_identity() {
        let p = history().predict(123);
        assert!(p.stale);
        assert_eq!(p.pose, Pose::IDENTITY);
    }

    #[test]
    fn test_exact_timestamp_returns_sample() {
        let mut h = history();
        h.record(10 * MS, at(1.0));
        h.record(20 * MS, at(2.0));
        h.record(30 * MS, yaw(0.5));
        let p = h.predict(20 * MS);
        assert!(!p.stale);
        assert_eq!(p.pose, at(2.0));
        assert_eq!(h.predict(30 * MS).pose, yaw(0.5));
    }

    #[test]
    fn test_interpolates_between_samples() {
        let mut h = history();
        h.record(10 * MS, at(0.0));
        h.record(20 * MS, at(1.0));
        let p = h.predict(15 * MS);
        assert!(!p.stale);
        assert!(close(p.pose.position, DVec3::new(0.5, 0.0, 0.0)));
    }

    #[test]
    fn test_slerps_orientation() {
        let mut h = history();
        h.record(0, yaw(0.0));
        h.record(10 * MS, yaw(FRAC_PI_2));
        let p = h.predict(5 * MS);
        let expected = DQuat::from_rotation_y(FRAC_PI_2 / 2.0);
        assert!(p.pose.orientation.angle_between(expected) < 1e-9);
    }

    #[test]
    fn test_extrapolates_from_last_two_samples() {
        let mut h = history();
        h.record(10 * MS, at(0.0));
        h.record(20 * MS, at(1.0));
        let p = h.predict(25 * MS);
        assert!(!p.stale);
        assert!(close(p.pose.position, DVec3::new(1.5, 0.0, 0.0)));
    }

    #[test]
    fn test_extrapolates_rotation() {
        let mut h = history();
        h.record(0, yaw(0.0));
        h.record(10 * MS, yaw(0.1));
        let p = h.predict(20 * MS);
        let expected = DQuat::from_rotation_y(0.2);
        assert!(p.pose.orientation.angle_between(expected) < 1e-9);
    }

    #[test]
    fn test_extrapolation_is_capped() {
        let mut h = history();
        h.record(0, at(0.0));
        h.record(10 * MS, at(1.0));
        // 1 s ahead is clamped to the 100 ms cap: 10 units past the last sample.
        let p = h.predict(1_010 * MS);
        assert!(p.stale);
        assert_eq!(p.timestamp_ns, 110 * MS);
        assert!(close(p.pose.position, DVec3::new(11.0, 0.0, 0.0)));
    }

    #[test]
    fn test_single_sample_returned_as_is() {
        let mut h = history();
        h.record(10 * MS, at(4.0));
        let p = h.predict(50 * MS);
        assert!(!p.stale);
        assert_eq!(p.pose, at(4.0));
    }

    #[test]
    fn test_clear_empties_history() {
        let mut h = history();
        h.record(MS, at(1.0));
        h.clear();
        assert!(h.is_empty());
        // After clear, older timestamps are accepted again.
        assert!(h.record(1, at(1.0)));
    }
}
