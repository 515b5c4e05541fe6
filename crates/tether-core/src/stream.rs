//! Session composition root.
//!
//! `StreamSession` owns every component for the lifetime of one client
//! connection. Two threads run while it is started: the encode pipeline and
//! the tracking-ingest loop, which drains the event queue once per tick and
//! is the only writer of the bitrate state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_common::monotonic_ns;
use tether_media::{CaptureSource, VideoEncoder};

use crate::bitrate::{read_bitrate, BitrateController, BitrateState, SharedBitrate};
use crate::config::StreamerConfig;
use crate::haptics::HapticShaper;
use crate::network::{event_queue, EventSender, NetworkSession, NetworkStats, SessionEvent, Transport};
use crate::pipeline::{EncodePipeline, PipelineStats};
use crate::pose_history::PoseHistory;
use crate::registry::{DeviceRegistry, DeviceSink};
use crate::types::{DeviceId, PredictedPose};
use crate::{lock, StreamError, StreamResult};

/// State the ingest thread owns while running and hands back on stop.
struct IngestState {
    events: mpsc::Receiver<SessionEvent>,
    controller: BitrateController,
}

pub struct StreamSession {
    head_history: Arc<Mutex<PoseHistory>>,
    registry: Arc<DeviceRegistry>,
    network: Arc<NetworkSession>,
    pipeline: Arc<EncodePipeline>,
    bitrate: SharedBitrate,
    events: EventSender,
    ingest_tick: Duration,

    running: Arc<AtomicBool>,
    idle: Mutex<Option<IngestState>>,
    ingest: Mutex<Option<JoinHandle<IngestState>>>,
}

impl StreamSession {
    pub fn new(
        config: StreamerConfig,
        transport: Arc<dyn Transport>,
        capture: Box<dyn CaptureSource>,
        encoder: Box<dyn VideoEncoder>,
        device_sink: Arc<dyn DeviceSink>,
    ) -> StreamResult<Self> {
        config.validate()?;

        let head_history = Arc::new(Mutex::new(PoseHistory::new(DeviceId::Head, &config.pose)));
        let controller = BitrateController::new(config.bitrate.clone(), config.video.refresh_hz);
        let bitrate = controller.shared();
        let network = Arc::new(NetworkSession::new(config.network.clone(), transport));
        let registry = Arc::new(DeviceRegistry::new(
            Arc::clone(&head_history),
            HapticShaper::new(config.haptics)?,
            device_sink,
            network.clone(),
            config.trackers,
            config.pose.controller_pose_time_offset_ns,
        ));
        let encode_config = config
            .video
            .encode_config(read_bitrate(&bitrate).current_bitrate_bps);
        let pipeline = Arc::new(EncodePipeline::new(
            config.pipeline.clone(),
            encode_config,
            capture,
            encoder,
            Arc::clone(&head_history),
            Arc::clone(&bitrate),
            network.clone(),
        ));
        let (events, receiver) = event_queue(config.network.event_queue_capacity);

        Ok(Self {
            head_history,
            registry,
            network,
            pipeline,
            bitrate,
            events,
            ingest_tick: Duration::from_millis(config.ingest_tick_ms),
            running: Arc::new(AtomicBool::new(false)),
            idle: Mutex::new(Some(IngestState {
                events: receiver,
                controller,
            })),
            ingest: Mutex::new(None),
        })
    }

    /// Open the transport, initialize the encoder and spawn the worker
    /// threads. Any failure is returned and leaves nothing running.
    pub fn start(&self) -> StreamResult<()> {
        let mut ingest = lock(&self.ingest);
        if ingest.is_some() {
            return Ok(());
        }
        let Some(state) = lock(&self.idle).take() else {
            return Err(tether_common::Error::internal("ingest state lost after a panic").into());
        };

        if let Err(err) = self.network.start() {
            *lock(&self.idle) = Some(state);
            return Err(err);
        }
        if let Err(err) = self.pipeline.start() {
            self.network.stop();
            *lock(&self.idle) = Some(state);
            return Err(err);
        }

        self.running.store(true, Ordering::SeqCst);
        let worker = IngestLoop {
            state,
            registry: Arc::clone(&self.registry),
            network: Arc::clone(&self.network),
            pipeline: Arc::clone(&self.pipeline),
            events: self.events.clone(),
            running: Arc::clone(&self.running),
            tick: self.ingest_tick,
            seen_dropped_events: self.events.dropped(),
            seen_coalesced_ticks: self.pipeline.stats().ticks_coalesced,
        };
        match thread::Builder::new()
            .name("tether-ingest".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => *ingest = Some(handle),
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                self.pipeline.stop();
                self.network.stop();
                return Err(StreamError::Spawn("ingest", err));
            }
        }

        info!("stream session {:08x} started", self.network.session_id());
        Ok(())
    }

    /// Drain and tear down. Idempotent.
    pub fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);

        // The in-flight frame still needs the network, so the pipeline goes first.
        self.pipeline.stop();

        let handle = lock(&self.ingest).take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(state) => *lock(&self.idle) = Some(state),
                Err(_) => warn!("ingest thread panicked"),
            }
        }

        self.network.stop();
        lock(&self.head_history).clear();

        if was_running {
            info!("stream session {:08x} stopped", self.network.session_id());
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Producer handle for the inbound transport.
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    /// External vsync tick for pipelines that are not self-paced.
    pub fn on_vsync(&self) {
        self.pipeline.on_frame_interval_elapsed();
    }

    pub fn insert_idr(&self) {
        self.pipeline.insert_idr();
    }

    pub fn predict_head_pose(&self, target_ns: u64) -> PredictedPose {
        lock(&self.head_history).predict(target_ns)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn bitrate_state(&self) -> BitrateState {
        read_bitrate(&self.bitrate)
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    pub fn network_stats(&self) -> NetworkStats {
        self.network.stats()
    }

    /// Client-to-host clock offset learned from client pings.
    pub fn clock_offset_ns(&self) -> Option<i64> {
        self.network.clock_offset_ns()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.stop();
    }
}

struct IngestLoop {
    state: IngestState,
    registry: Arc<DeviceRegistry>,
    network: Arc<NetworkSession>,
    pipeline: Arc<EncodePipeline>,
    events: EventSender,
    running: Arc<AtomicBool>,
    tick: Duration,
    seen_dropped_events: u64,
    seen_coalesced_ticks: u64,
}

impl IngestLoop {
    fn run(mut self) -> IngestState {
        debug!("ingest thread running");
        while self.running.load(Ordering::SeqCst) {
            self.tick(monotonic_ns());
            thread::sleep(self.tick);
        }
        debug!("ingest thread exiting");
        self.state
    }

    fn tick(&mut self, now_ns: u64) {
        while let Ok(event) = self.state.events.try_recv() {
            self.handle(event, now_ns);
        }

        // Timeouts only inform the bitrate estimate. The client reports
        // frames it could not rebuild on its own.
        for feedback in self.network.expire_pending(now_ns) {
            self.state.controller.on_frame_feedback(feedback);
        }

        // Dropped work means the host cannot keep up; treat it as congestion.
        let dropped = self.events.dropped();
        let coalesced = self.pipeline.stats().ticks_coalesced;
        if dropped > self.seen_dropped_events || coalesced > self.seen_coalesced_ticks {
            debug!(
                "resource pressure: {} dropped events, {} coalesced ticks",
                dropped - self.seen_dropped_events,
                coalesced - self.seen_coalesced_ticks
            );
            self.seen_dropped_events = dropped;
            self.seen_coalesced_ticks = coalesced;
            self.state.controller.on_frame_dropped();
        }

        if let Err(err) = self.network.maybe_probe(now_ns) {
            debug!("latency probe not sent: {err}");
        }
    }

    fn handle(&mut self, event: SessionEvent, now_ns: u64) {
        let controller = &mut self.state.controller;
        match event {
            SessionEvent::Tracking(mut message) => {
                message.target_timestamp_ns =
                    self.network.to_host_time(message.target_timestamp_ns);
                self.registry.route_tracking(&message);
            }
            SessionEvent::FrameAck { frame_index } => {
                if let Some(feedback) = self.network.handle_ack(frame_index, now_ns) {
                    controller.on_frame_feedback(feedback);
                }
            }
            SessionEvent::FecFailure { frame_index } => {
                self.pipeline.on_fec_failure();
                match self.network.handle_fec_failure(frame_index) {
                    Some(feedback) => controller.on_frame_feedback(feedback),
                    None => controller.on_fec_failure(),
                }
            }
            SessionEvent::Ping {
                probe_id,
                sent_ns,
                received_ns,
            } => {
                if let Err(err) = self.network.handle_ping(probe_id, sent_ns, received_ns) {
                    debug!("pong not sent: {err}");
                }
            }
            SessionEvent::Pong { probe_id, .. } => {
                if let Some(rtt_ns) = self.network.handle_pong(probe_id, now_ns) {
                    controller.on_latency_sample(rtt_ns);
                }
            }
            SessionEvent::NetworkLatency { latency_ns } => {
                controller.on_latency_sample(latency_ns);
            }
            SessionEvent::RequestKeyframe => self.pipeline.insert_idr(),
            SessionEvent::Battery {
                device_path,
                gauge,
                is_plugged,
            } => {
                self.registry.route_battery(device_path, gauge, is_plugged);
            }
            SessionEvent::BitrateRequest {
                bitrate_bps,
                adaptive,
                max_bitrate_bps,
            } => controller.set_parameters(bitrate_bps, adaptive, max_bitrate_bps),
            SessionEvent::Disconnected => {
                warn!("client disconnected");
                self.pipeline.on_packet_loss();
            }
        }
    }
}
