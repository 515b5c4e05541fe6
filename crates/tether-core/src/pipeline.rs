//! Capture -> encode -> hand-off loop.
//!
//! One frame is in flight at a time. Ticks that arrive while a frame is being
//! produced are coalesced, never queued. Loss signals arm a keyframe for the
//! next cycle.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tether_common::monotonic_ns;
use tether_media::{CaptureSource, EncodeConfig, VideoEncoder};

use crate::bitrate::{read_bitrate, BitrateState, SharedBitrate};
use crate::pose_history::PoseHistory;
use crate::types::{EncodedVideoFrame, PredictedPose};
use crate::{lock, StreamError, StreamResult};

/// How often an externally ticked pipeline checks for stop.
const STOP_POLL: Duration = Duration::from_millis(50);

thread_local! {
    /// Set while this thread runs a cycle, so a sink that stops the
    /// pipeline does not wait on itself.
    static IN_CYCLE: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tick on the bitrate pacing interval instead of waiting for
    /// `on_frame_interval_elapsed`.
    pub self_paced: bool,
    /// Force a keyframe every N frames. 0 disables periodic keyframes.
    pub keyframe_interval_frames: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            self_paced: true,
            keyframe_interval_frames: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineStage {
    Idle = 0,
    Capturing = 1,
    Encoding = 2,
    Sent = 3,
}

impl PipelineStage {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineStage::Capturing,
            2 => PipelineStage::Encoding,
            3 => PipelineStage::Sent,
            _ => PipelineStage::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameJob {
    pub frame_index: u64,
    pub presentation_ts_ns: u64,
    pub predicted_head_pose: PredictedPose,
    pub keyframe_requested: bool,
}

/// Receiver of encoded frames.
pub trait FrameSink: Send + Sync {
    fn submit_frame(&self, frame: EncodedVideoFrame) -> StreamResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_sent: u64,
    pub capture_failures: u64,
    pub encode_failures: u64,
    pub send_failures: u64,
    pub keyframes: u64,
    pub ticks_coalesced: u64,
    pub loss_events: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Frame handed off with this index.
    Sent(u64),
    /// Capture, encode or hand-off failed; the frame was dropped.
    Skipped,
    /// Another frame is in flight.
    Busy,
    /// The pipeline is not started.
    NotRunning,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    capture_failures: AtomicU64,
    encode_failures: AtomicU64,
    send_failures: AtomicU64,
    keyframes: AtomicU64,
    ticks_coalesced: AtomicU64,
    loss_events: AtomicU64,
}

struct Shared {
    config: PipelineConfig,
    encode_config: EncodeConfig,
    capture: Mutex<Box<dyn CaptureSource>>,
    encoder: Mutex<Box<dyn VideoEncoder>>,
    head_history: Arc<Mutex<PoseHistory>>,
    bitrate: SharedBitrate,
    sink: Arc<dyn FrameSink>,
    // Held for a whole cycle. stop() takes it before releasing the encoder.
    cycle: Mutex<()>,

    encoder_live: AtomicBool,
    running: AtomicBool,
    in_flight: AtomicBool,
    keyframe_requested: AtomicBool,
    loss_recovery: AtomicBool,
    stage: AtomicU8,
    next_frame_index: AtomicU64,
    applied_bitrate_bps: AtomicU64,
    counters: Counters,
}

pub struct EncodePipeline {
    shared: Arc<Shared>,
    tick_tx: Mutex<Option<SyncSender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EncodePipeline {
    pub fn new(
        config: PipelineConfig,
        encode_config: EncodeConfig,
        capture: Box<dyn CaptureSource>,
        encoder: Box<dyn VideoEncoder>,
        head_history: Arc<Mutex<PoseHistory>>,
        bitrate: SharedBitrate,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                encode_config,
                capture: Mutex::new(capture),
                encoder: Mutex::new(encoder),
                head_history,
                bitrate,
                sink,
                cycle: Mutex::new(()),
                encoder_live: AtomicBool::new(false),
                running: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                keyframe_requested: AtomicBool::new(false),
                loss_recovery: AtomicBool::new(false),
                stage: AtomicU8::new(PipelineStage::Idle as u8),
                next_frame_index: AtomicU64::new(0),
                applied_bitrate_bps: AtomicU64::new(0),
                counters: Counters::default(),
            }),
            tick_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Initialize the encoder and spawn the pipeline thread. A no-op when
    /// already running.
    pub fn start(&self) -> StreamResult<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            debug!("encode pipeline already running");
            return Ok(());
        }

        let shared = &self.shared;
        let bitrate_bps = read_bitrate(&shared.bitrate).current_bitrate_bps;
        let encode_config = EncodeConfig {
            bitrate_bps,
            ..shared.encode_config
        };
        lock(&shared.encoder).initialize(&encode_config)?;
        shared.applied_bitrate_bps.store(bitrate_bps, Ordering::SeqCst);
        shared.encoder_live.store(true, Ordering::SeqCst);
        shared.keyframe_requested.store(true, Ordering::SeqCst);
        shared.running.store(true, Ordering::SeqCst);

        let (tx, rx) = mpsc::sync_channel::<()>(1);
        let thread_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("tether-encode".into())
            .spawn(move || run_loop(thread_shared, rx));
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                *lock(&self.tick_tx) = Some(tx);
                info!(
                    "encode pipeline started ({}x{} @ {} fps, {} bps, {})",
                    encode_config.resolution.width,
                    encode_config.resolution.height,
                    encode_config.fps,
                    bitrate_bps,
                    if shared.config.self_paced {
                        "self-paced"
                    } else {
                        "externally ticked"
                    }
                );
                Ok(())
            }
            Err(err) => {
                shared.running.store(false, Ordering::SeqCst);
                shutdown_encoder(shared);
                Err(StreamError::Spawn("encode", err))
            }
        }
    }

    /// Let the in-flight frame finish, stop the thread and release the
    /// encoder. Safe to call repeatedly and from any thread, including cycles
    /// driven through `run_cycle`.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        lock(&self.tick_tx).take();

        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                warn!("encode pipeline stopped from its own thread; not joining");
            } else if handle.join().is_err() {
                warn!("encode thread panicked");
            }
        }

        let _cycle = if IN_CYCLE.with(Cell::get) {
            warn!("encode pipeline stopped from inside a cycle");
            None
        } else {
            Some(lock(&self.shared.cycle))
        };
        if shutdown_encoder(&self.shared) {
            let stats = self.stats();
            info!(
                "encode pipeline stopped: {} frames, {} keyframes, {} coalesced ticks",
                stats.frames_sent, stats.keyframes, stats.ticks_coalesced
            );
        }
        self.shared.set_stage(PipelineStage::Idle);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Vsync tick. Coalesced if a frame is still in flight.
    pub fn on_frame_interval_elapsed(&self) {
        let shared = &self.shared;
        if shared.in_flight.load(Ordering::SeqCst) {
            shared.counters.ticks_coalesced.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(tx) = lock(&self.tick_tx).as_ref() {
            match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Disconnected(())) => {}
                Err(TrySendError::Full(())) => {
                    shared.counters.ticks_coalesced.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn on_packet_loss(&self) {
        self.enter_loss_recovery("packet loss");
    }

    pub fn on_fec_failure(&self) {
        self.enter_loss_recovery("fec failure");
    }

    /// Force the next frame to be a keyframe.
    pub fn insert_idr(&self) {
        debug!("keyframe requested");
        self.shared.keyframe_requested.store(true, Ordering::SeqCst);
    }

    fn enter_loss_recovery(&self, reason: &str) {
        self.shared.counters.loss_events.fetch_add(1, Ordering::Relaxed);
        if !self.shared.loss_recovery.swap(true, Ordering::SeqCst) {
            debug!("loss recovery armed: {reason}");
        }
    }

    pub fn in_loss_recovery(&self) -> bool {
        self.shared.loss_recovery.load(Ordering::SeqCst)
    }

    pub fn stage(&self) -> PipelineStage {
        PipelineStage::from_u8(self.shared.stage.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            capture_failures: c.capture_failures.load(Ordering::Relaxed),
            encode_failures: c.encode_failures.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            keyframes: c.keyframes.load(Ordering::Relaxed),
            ticks_coalesced: c.ticks_coalesced.load(Ordering::Relaxed),
            loss_events: c.loss_events.load(Ordering::Relaxed),
        }
    }

    /// Run one capture/encode/hand-off cycle on the calling thread.
    pub fn run_cycle(&self) -> CycleOutcome {
        self.shared.run_cycle()
    }
}

impl Drop for EncodePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(shared: Arc<Shared>, rx: mpsc::Receiver<()>) {
    debug!("encode thread running");
    while shared.running.load(Ordering::SeqCst) {
        if shared.config.self_paced {
            let started = Instant::now();
            shared.run_cycle();
            let interval =
                Duration::from_nanos(read_bitrate(&shared.bitrate).min_frame_interval_ns);
            let remaining = interval.saturating_sub(started.elapsed());
            // Early wake-ups come from external ticks or from stop.
            if let Err(RecvTimeoutError::Disconnected) = rx.recv_timeout(remaining) {
                break;
            }
        } else {
            match rx.recv_timeout(STOP_POLL) {
                Ok(()) => {
                    if shared.running.load(Ordering::SeqCst) {
                        shared.run_cycle();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
    debug!("encode thread exiting");
}

/// Shut the encoder down if it is live. Returns whether this call did it.
fn shutdown_encoder(shared: &Shared) -> bool {
    if shared.encoder_live.swap(false, Ordering::SeqCst) {
        lock(&shared.encoder).shutdown();
        true
    } else {
        false
    }
}

/// Clears the single-flight flag on every exit path.
struct InFlight<'a>(&'a Shared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        IN_CYCLE.with(|c| c.set(true));
        Self(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        IN_CYCLE.with(|c| c.set(false));
        self.0.set_stage(PipelineStage::Idle);
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

impl Shared {
    fn set_stage(&self, stage: PipelineStage) {
        self.stage.store(stage as u8, Ordering::SeqCst);
    }

    fn run_cycle(&self) -> CycleOutcome {
        if !self.encoder_live.load(Ordering::SeqCst) {
            return CycleOutcome::NotRunning;
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.counters.ticks_coalesced.fetch_add(1, Ordering::Relaxed);
            return CycleOutcome::Busy;
        }
        let _guard = InFlight::enter(self);
        let _cycle = lock(&self.cycle);
        // stop() may have released the encoder between the check and the flag.
        if !self.encoder_live.load(Ordering::SeqCst) {
            return CycleOutcome::NotRunning;
        }

        self.set_stage(PipelineStage::Capturing);
        let state = read_bitrate(&self.bitrate);
        self.apply_bitrate(state.current_bitrate_bps);

        let job = self.next_job(&state);

        let raw = match lock(&self.capture).capture_frame() {
            Ok(raw) => raw,
            Err(err) => {
                warn!("capture failed for frame {}: {err}", job.frame_index);
                self.counters.capture_failures.fetch_add(1, Ordering::Relaxed);
                self.rearm_keyframe(&job);
                return CycleOutcome::Skipped;
            }
        };

        self.set_stage(PipelineStage::Encoding);
        let started = Instant::now();
        let encoded = lock(&self.encoder).encode(raw, job.keyframe_requested);
        let encode_time_ns = started.elapsed().as_nanos() as u64;
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("encode failed for frame {}: {err}", job.frame_index);
                self.counters.encode_failures.fetch_add(1, Ordering::Relaxed);
                self.rearm_keyframe(&job);
                return CycleOutcome::Skipped;
            }
        };

        self.set_stage(PipelineStage::Sent);
        let frame = EncodedVideoFrame {
            frame_index: job.frame_index,
            presentation_ts_ns: job.presentation_ts_ns,
            keyframe: encoded.keyframe,
            encode_time_ns,
            head_pose: job.predicted_head_pose,
            payload: encoded.data,
        };
        if let Err(err) = self.sink.submit_frame(frame) {
            warn!("hand-off failed for frame {}: {err}", job.frame_index);
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            // The receiver's reference chain is broken either way.
            self.keyframe_requested.store(true, Ordering::SeqCst);
            return CycleOutcome::Skipped;
        }

        if encoded.keyframe {
            self.counters.keyframes.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.next_frame_index.fetch_add(1, Ordering::SeqCst);
        CycleOutcome::Sent(job.frame_index)
    }

    fn next_job(&self, state: &BitrateState) -> FrameJob {
        let frame_index = self.next_frame_index.load(Ordering::SeqCst);
        let periodic = self.config.keyframe_interval_frames > 0
            && frame_index % self.config.keyframe_interval_frames == 0;
        let requested = self.keyframe_requested.swap(false, Ordering::SeqCst);
        let recovering = self.loss_recovery.swap(false, Ordering::SeqCst);

        // Predict for when the frame reaches the display: one frame of
        // pipeline plus the one-way network delay.
        let presentation_ts_ns = monotonic_ns()
            .saturating_add(state.min_frame_interval_ns)
            .saturating_add((state.latency_ema_ns / 2.0) as u64);
        let predicted_head_pose = lock(&self.head_history).predict(presentation_ts_ns);

        FrameJob {
            frame_index,
            presentation_ts_ns,
            predicted_head_pose,
            keyframe_requested: periodic || requested || recovering,
        }
    }

    fn rearm_keyframe(&self, job: &FrameJob) {
        if job.keyframe_requested {
            self.keyframe_requested.store(true, Ordering::SeqCst);
        }
    }

    fn apply_bitrate(&self, bitrate_bps: u64) {
        if self.applied_bitrate_bps.load(Ordering::SeqCst) == bitrate_bps {
            return;
        }
        match lock(&self.encoder).set_bitrate(bitrate_bps) {
            Ok(()) => {
                self.applied_bitrate_bps.store(bitrate_bps, Ordering::SeqCst);
            }
            Err(err) => warn!("encoder rejected bitrate {bitrate_bps}: {err}"),
        }
    }
}
