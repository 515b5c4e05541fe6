use std::fmt;

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};
use tether_wire::DeviceMotion;

/// Logical tracked device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceId {
    Head,
    LeftHand,
    RightHand,
    Tracker(u32),
}

impl DeviceId {
    pub fn path(&self) -> String {
        match self {
            DeviceId::Head => "/user/head".to_string(),
            DeviceId::LeftHand => "/user/hand/left".to_string(),
            DeviceId::RightHand => "/user/hand/right".to_string(),
            DeviceId::Tracker(n) => format!("/user/tracker/{n}"),
        }
    }

    pub fn path_id(&self) -> u64 {
        tether_common::path_id(&self.path())
    }

    pub fn is_head(&self) -> bool {
        matches!(self, DeviceId::Head)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: DVec3,
    pub orientation: DQuat,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: DVec3::ZERO,
        orientation: DQuat::IDENTITY,
    };

    pub fn new(position: DVec3, orientation: DQuat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// Build a pose from a wire motion. Returns `None` for non-finite or
    /// degenerate orientations.
    pub fn from_motion(motion: &DeviceMotion) -> Option<Self> {
        let [x, y, z, w] = motion.orientation;
        let orientation = DQuat::from_xyzw(x, y, z, w);
        let length = orientation.length();
        if !length.is_finite() || length < 1e-6 {
            return None;
        }
        let pose = Self {
            position: DVec3::from_array(motion.position),
            orientation: orientation / length,
        };
        pose.is_finite().then_some(pose)
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.orientation.is_finite()
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    pub device: DeviceId,
    pub timestamp_ns: u64,
    pub pose: Pose,
    pub valid: bool,
}

/// Result of a pose query. `stale` means the pose is not backed by data
/// around the requested time (empty history, target before the oldest sample
/// or past the extrapolation cap).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictedPose {
    pub pose: Pose,
    pub timestamp_ns: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HapticCommand {
    pub device: DeviceId,
    pub duration_s: f32,
    pub frequency_hz: f32,
    pub amplitude: f32,
}

/// An encoded frame on its way to the network.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedVideoFrame {
    pub frame_index: u64,
    pub presentation_ts_ns: u64,
    pub keyframe: bool,
    pub encode_time_ns: u64,
    pub head_pose: PredictedPose,
    pub payload: Vec<u8>,
}
