//! Logical device table and inbound routing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use tether_common::path_id;
use tether_wire::{ButtonEntry, ButtonValue, TrackingMessage};

use crate::haptics::HapticShaper;
use crate::lock;
use crate::pose_history::PoseHistory;
use crate::types::{DeviceId, HapticCommand, Pose};

/// Host-runtime side of a device: where poses, battery and property updates
/// for non-head devices end up.
pub trait DeviceSink: Send + Sync {
    fn report_pose(&self, device: DeviceId, timestamp_ns: u64, pose: &Pose);
    fn report_battery(&self, device: DeviceId, gauge: f32, is_charging: bool);
    fn report_property(&self, device: DeviceId, container: u64, key: &str, value: &PropertyValue);
    fn report_button(&self, device: DeviceId, path: u64, value: ButtonValue);
}

/// Outbound haptic channel to the headset.
pub trait HapticSink: Send + Sync {
    fn forward_haptic(&self, command: &HapticCommand);
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub container: u64,
    pub battery_gauge: Option<f32>,
    pub is_charging: bool,
}

const HAND_INPUTS: &[&str] = &[
    "system/click",
    "menu/click",
    "a/click",
    "a/touch",
    "b/click",
    "b/touch",
    "x/click",
    "x/touch",
    "y/click",
    "y/touch",
    "trigger/click",
    "trigger/value",
    "trigger/touch",
    "squeeze/click",
    "squeeze/value",
    "squeeze/force",
    "thumbstick/x",
    "thumbstick/y",
    "thumbstick/click",
    "thumbstick/touch",
    "thumbrest/touch",
];

struct RegistryTables {
    records: HashMap<DeviceId, DeviceRecord>,
    by_path: HashMap<u64, DeviceId>,
    by_container: HashMap<u64, DeviceId>,
    buttons: HashMap<u64, DeviceId>,
}

pub struct DeviceRegistry {
    head_history: Arc<Mutex<PoseHistory>>,
    shaper: HapticShaper,
    device_sink: Arc<dyn DeviceSink>,
    haptic_sink: Arc<dyn HapticSink>,
    controller_time_offset_ns: i64,
    tables: Mutex<RegistryTables>,
}

impl DeviceRegistry {
    /// Registers the head, both hands and `trackers` generic trackers.
    /// Property containers are numbered from 1 in that order.
    pub fn new(
        head_history: Arc<Mutex<PoseHistory>>,
        shaper: HapticShaper,
        device_sink: Arc<dyn DeviceSink>,
        haptic_sink: Arc<dyn HapticSink>,
        trackers: u32,
        controller_time_offset_ns: i64,
    ) -> Self {
        let mut tables = RegistryTables {
            records: HashMap::new(),
            by_path: HashMap::new(),
            by_container: HashMap::new(),
            buttons: HashMap::new(),
        };

        let devices = [DeviceId::Head, DeviceId::LeftHand, DeviceId::RightHand]
            .into_iter()
            .chain((0..trackers).map(DeviceId::Tracker));
        for (index, id) in devices.enumerate() {
            let container = index as u64 + 1;
            tables.by_path.insert(id.path_id(), id);
            tables.by_container.insert(container, id);
            tables.records.insert(
                id,
                DeviceRecord {
                    id,
                    container,
                    battery_gauge: None,
                    is_charging: false,
                },
            );
        }
        for hand in [DeviceId::LeftHand, DeviceId::RightHand] {
            for input in HAND_INPUTS {
                let path = format!("{}/input/{input}", hand.path());
                tables.buttons.insert(path_id(&path), hand);
            }
        }

        Self {
            head_history,
            shaper,
            device_sink,
            haptic_sink,
            controller_time_offset_ns,
            tables: Mutex::new(tables),
        }
    }

    pub fn device_for_path(&self, path: u64) -> Option<DeviceId> {
        lock(&self.tables).by_path.get(&path).copied()
    }

    pub fn record(&self, device: DeviceId) -> Option<DeviceRecord> {
        lock(&self.tables).records.get(&device).cloned()
    }

    /// Register an extra button path. The owner is the hand whose path
    /// prefixes it.
    pub fn register_button(&self, path: &str) -> Option<DeviceId> {
        let owner = [DeviceId::LeftHand, DeviceId::RightHand]
            .into_iter()
            .find(|hand| path.starts_with(&format!("{}/", hand.path())))?;
        lock(&self.tables).buttons.insert(path_id(path), owner);
        Some(owner)
    }

    /// Head poses go to the pose history, every other device to the sink.
    pub fn route_pose(&self, device: DeviceId, timestamp_ns: u64, pose: Pose) -> bool {
        if device.is_head() {
            return lock(&self.head_history).record(timestamp_ns, pose);
        }
        if !pose.is_finite() {
            debug!("dropping non-finite {device} pose");
            return false;
        }
        let timestamp_ns = timestamp_ns.saturating_add_signed(self.controller_time_offset_ns);
        self.device_sink.report_pose(device, timestamp_ns, &pose);
        true
    }

    /// Route every motion and button in a tracking packet. Returns the
    /// number of poses accepted.
    pub fn route_tracking(&self, message: &TrackingMessage) -> usize {
        let mut accepted = 0;
        for motion in &message.motions {
            let Some(device) = self.device_for_path(motion.device_path) else {
                debug!("tracking for unknown device path {:#x}", motion.device_path);
                continue;
            };
            let Some(pose) = Pose::from_motion(motion) else {
                debug!("dropping malformed {device} motion");
                continue;
            };
            if self.route_pose(device, message.target_timestamp_ns, pose) {
                accepted += 1;
            }
        }
        for button in &message.buttons {
            self.route_button(*button);
        }
        accepted
    }

    pub fn route_haptic(&self, path: u64, command: HapticCommand) -> bool {
        match self.device_for_path(path) {
            Some(device) => self.forward_haptic(device, command),
            None => {
                debug!("haptic event for unknown path {path:#x}");
                false
            }
        }
    }

    pub fn route_haptic_by_container(&self, container: u64, command: HapticCommand) -> bool {
        let device = lock(&self.tables).by_container.get(&container).copied();
        match device {
            Some(device) => self.forward_haptic(device, command),
            None => {
                debug!("haptic event for unknown container {container}");
                false
            }
        }
    }

    fn forward_haptic(&self, device: DeviceId, command: HapticCommand) -> bool {
        let shaped = self.shaper.shape(&HapticCommand { device, ..command });
        self.haptic_sink.forward_haptic(&shaped);
        true
    }

    pub fn route_battery(&self, path: u64, gauge: f32, is_charging: bool) -> bool {
        let gauge = if gauge.is_finite() {
            gauge.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let device = {
            let mut tables = lock(&self.tables);
            let Some(device) = tables.by_path.get(&path).copied() else {
                drop(tables);
                debug!("battery report for unknown path {path:#x}");
                return false;
            };
            if let Some(record) = tables.records.get_mut(&device) {
                if record.is_charging != is_charging {
                    info!("{device} charging: {is_charging}");
                }
                record.battery_gauge = Some(gauge);
                record.is_charging = is_charging;
            }
            device
        };
        self.device_sink.report_battery(device, gauge, is_charging);
        true
    }

    pub fn route_property(&self, device: DeviceId, key: &str, value: PropertyValue) -> bool {
        let Some(container) = lock(&self.tables).records.get(&device).map(|r| r.container) else {
            debug!("property {key} for unregistered device {device}");
            return false;
        };
        self.device_sink
            .report_property(device, container, key, &value);
        true
    }

    pub fn route_button(&self, entry: ButtonEntry) -> bool {
        let owner = lock(&self.tables).buttons.get(&entry.path).copied();
        match owner {
            Some(device) => {
                self.device_sink.report_button(device, entry.path, entry.value);
                true
            }
            None => {
                debug!("button for unknown path {:#x}", entry.path);
                false
            }
        }
    }
}
