#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tether_core::{
    DeviceId, DeviceSink, Pose, PropertyValue, StreamResult, Transport,
};
use tether_media::{
    CaptureSource, EncodeConfig, EncodedFrame, FrameFormat, MediaError, MediaResult, RawFrame,
    Resolution, VideoEncoder,
};
use tether_wire::ButtonValue;

pub const RES: Resolution = Resolution {
    width: 32,
    height: 16,
};

/// Ordered record of what the capture and encoder mocks did.
pub type EventLog = Arc<Mutex<Vec<&'static str>>>;

pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[derive(Default)]
pub struct RecordingTransport {
    pub packets: Mutex<Vec<Bytes>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

impl Transport for RecordingTransport {
    fn open(&self) -> StreamResult<()> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn send(&self, packet: Bytes) -> StreamResult<()> {
        self.packets.lock().unwrap().push(packet);
        Ok(())
    }
}

pub struct MockCapture {
    pub log: EventLog,
}

impl CaptureSource for MockCapture {
    fn capture_frame(&mut self) -> MediaResult<RawFrame> {
        self.log.lock().unwrap().push("capture");
        Ok(RawFrame {
            resolution: RES,
            format: FrameFormat::Rgba8,
            timestamp_ns: 0,
            stride: RES.width as u32 * 4,
            bytes: vec![0; RES.pixel_count() as usize * 4],
        })
    }
}

#[derive(Default)]
pub struct EncoderProbe {
    pub forced: Mutex<Vec<bool>>,
    pub shutdowns: AtomicUsize,
    pub fail_init: AtomicBool,
    pub encode_delay: Mutex<Duration>,
}

pub struct MockEncoder {
    pub probe: Arc<EncoderProbe>,
    pub log: EventLog,
}

impl VideoEncoder for MockEncoder {
    fn initialize(&mut self, _config: &EncodeConfig) -> MediaResult<()> {
        if self.probe.fail_init.load(Ordering::SeqCst) {
            return Err(MediaError::Unavailable("mock".into()));
        }
        Ok(())
    }

    fn encode(&mut self, _frame: RawFrame, force_keyframe: bool) -> MediaResult<EncodedFrame> {
        self.log.lock().unwrap().push("encode_begin");
        let delay = *self.probe.encode_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.probe.forced.lock().unwrap().push(force_keyframe);
        self.log.lock().unwrap().push("encode_end");
        Ok(EncodedFrame {
            timestamp_ns: 0,
            keyframe: force_keyframe,
            data: vec![0xab; 300],
        })
    }

    fn set_bitrate(&mut self, _bitrate_bps: u64) -> MediaResult<()> {
        Ok(())
    }

    fn shutdown(&mut self) {
        self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct NullDeviceSink {
    pub poses: Mutex<Vec<(DeviceId, u64)>>,
    pub batteries: Mutex<Vec<(DeviceId, f32)>>,
}

impl DeviceSink for NullDeviceSink {
    fn report_pose(&self, device: DeviceId, timestamp_ns: u64, _pose: &Pose) {
        self.poses.lock().unwrap().push((device, timestamp_ns));
    }

    fn report_battery(&self, device: DeviceId, gauge: f32, _is_charging: bool) {
        self.batteries.lock().unwrap().push((device, gauge));
    }

    fn report_property(&self, _: DeviceId, _: u64, _: &str, _: &PropertyValue) {}

    fn report_button(&self, _: DeviceId, _: u64, _: ButtonValue) {}
}
