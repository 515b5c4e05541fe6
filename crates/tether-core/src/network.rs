//! Client connection: framing and sending video, pose/haptic/control
//! traffic, ack bookkeeping and latency probes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use tether_common::monotonic_ns;
use tether_wire::{
    chunk_video_payload, encode_msg, ControlMessage, FecBuilder, FecPacket, HapticsMessage,
    Message, PhysicalPacket, TrackingMessage, VideoChunk, HEADER_SIZE, MAX_DATAGRAM_SIZE,
    TETHER_VERSION,
};

use crate::bitrate::FrameFeedback;
use crate::pipeline::FrameSink;
use crate::registry::HapticSink;
use crate::types::{EncodedVideoFrame, HapticCommand};
use crate::{lock, StreamError, StreamResult};

/// Bytes reserved for the bincode envelope around a video chunk.
const CHUNK_OVERHEAD: usize = 64;

/// Probes awaiting their echo. Older ones are forgotten past this.
const MAX_OUTSTANDING_PROBES: usize = 32;

/// Each client ping moves the clock offset 1/8 of the way to its sample.
const CLOCK_OFFSET_GAIN: i128 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Largest video payload per chunk.
    pub max_chunk_payload: usize,
    /// Data + parity packets per FEC group. 0 disables FEC.
    pub fec_group_size: u32,
    /// Frames without an ack after this long count as lost.
    pub ack_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub event_queue_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_chunk_payload: MAX_DATAGRAM_SIZE - HEADER_SIZE - CHUNK_OVERHEAD,
            fec_group_size: 8,
            ack_timeout_ms: 250,
            probe_interval_ms: 500,
            event_queue_capacity: 1024,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> tether_common::Result<()> {
        use tether_common::Error;

        if self.max_chunk_payload == 0 {
            return Err(Error::config("network.max_chunk_payload must be positive"));
        }
        if self.fec_group_size == 1 {
            return Err(Error::config(
                "network.fec_group_size must be 0 (off) or at least 2",
            ));
        }
        if self.ack_timeout_ms == 0 {
            return Err(Error::config("network.ack_timeout_ms must be positive"));
        }
        if self.event_queue_capacity == 0 {
            return Err(Error::config("network.event_queue_capacity must be positive"));
        }
        Ok(())
    }
}

/// Outbound datagram transport.
pub trait Transport: Send + Sync {
    fn open(&self) -> StreamResult<()>;
    fn close(&self);
    fn send(&self, packet: Bytes) -> StreamResult<()>;
}

/// Inbound traffic, delivered to the ingest loop through the event queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Tracking(TrackingMessage),
    FrameAck { frame_index: u64 },
    FecFailure { frame_index: Option<u64> },
    /// Client probe. `sent_ns` is client clock, `received_ns` host clock.
    Ping { probe_id: u64, sent_ns: u64, received_ns: u64 },
    Pong { probe_id: u64, sent_ns: u64 },
    NetworkLatency { latency_ns: u64 },
    RequestKeyframe,
    Battery { device_path: u64, gauge: f32, is_plugged: bool },
    BitrateRequest { bitrate_bps: u64, adaptive: bool, max_bitrate_bps: u64 },
    Disconnected,
}

impl SessionEvent {
    /// Map a decoded client message onto an event. Host-bound traffic only;
    /// anything else yields `None`.
    pub fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::Tracking(tracking) => Some(SessionEvent::Tracking(tracking)),
            Message::Control(control) => Some(match control {
                ControlMessage::Ping { probe_id, sent_ns } => SessionEvent::Ping {
                    probe_id,
                    sent_ns,
                    received_ns: monotonic_ns(),
                },
                ControlMessage::Pong { probe_id, sent_ns } => {
                    SessionEvent::Pong { probe_id, sent_ns }
                }
                ControlMessage::FrameAck { frame_index } => SessionEvent::FrameAck { frame_index },
                ControlMessage::FecFailure { frame_index } => {
                    SessionEvent::FecFailure { frame_index }
                }
                ControlMessage::RequestKeyframe => SessionEvent::RequestKeyframe,
                ControlMessage::NetworkLatency { latency_us } => SessionEvent::NetworkLatency {
                    latency_ns: latency_us.saturating_mul(1_000),
                },
                ControlMessage::Battery {
                    device_path,
                    gauge,
                    is_plugged,
                } => SessionEvent::Battery {
                    device_path,
                    gauge,
                    is_plugged,
                },
                ControlMessage::BitrateRequest {
                    bitrate_bps,
                    adaptive,
                    max_bitrate_bps,
                } => SessionEvent::BitrateRequest {
                    bitrate_bps,
                    adaptive,
                    max_bitrate_bps,
                },
            }),
            Message::Video(_) | Message::Fec(_) | Message::Haptics(_) => None,
        }
    }
}

/// Producer side of the bounded event queue.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<SessionEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Enqueue without blocking. A full queue drops the event.
    pub fn push(&self, event: SessionEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("event queue full, dropping {event:?}");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub fn event_queue(capacity: usize) -> (EventSender, mpsc::Receiver<SessionEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub parity_packets_sent: u64,
    pub frames_acked: u64,
    pub frames_lost: u64,
    pub stray_acks: u64,
    pub fec_failures: u64,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_sent: AtomicU64,
    parity_packets_sent: AtomicU64,
    frames_acked: AtomicU64,
    frames_lost: AtomicU64,
    stray_acks: AtomicU64,
    fec_failures: AtomicU64,
}

/// Client-to-host clock mapping. Each client ping gives a sample of host
/// receive time minus client send time minus half the last round trip.
#[derive(Debug, Default)]
struct ClockSync {
    rtt_ns: Option<u64>,
    offset_ns: Option<i64>,
}

impl ClockSync {
    fn on_client_ping(&mut self, client_sent_ns: u64, received_ns: u64) -> i64 {
        let one_way = i128::from(self.rtt_ns.unwrap_or(0) / 2);
        let sample = i128::from(received_ns) - i128::from(client_sent_ns) - one_way;
        let offset = match self.offset_ns {
            Some(current) => {
                let current = i128::from(current);
                current + (sample - current) / CLOCK_OFFSET_GAIN
            }
            None => sample,
        };
        let offset = offset.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
        self.offset_ns = Some(offset);
        offset
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    sent_ns: u64,
    encode_time_ns: u64,
    transmit_time_ns: u64,
}

pub struct NetworkSession {
    config: NetworkConfig,
    transport: Arc<dyn Transport>,
    session_id: u32,
    running: AtomicBool,
    next_packet_id: AtomicU64,
    next_probe_id: AtomicU64,
    last_probe_ns: AtomicU64,
    // Also orders sends, so the data packets of a parity group get
    // consecutive ids.
    fec: Mutex<Option<FecBuilder>>,
    pending: Mutex<HashMap<u64, PendingFrame>>,
    // Probe id -> host send time.
    probes: Mutex<HashMap<u64, u64>>,
    clock: Mutex<ClockSync>,
    counters: Counters,
}

impl NetworkSession {
    pub fn new(config: NetworkConfig, transport: Arc<dyn Transport>) -> Self {
        let fec = if config.fec_group_size >= 2 {
            FecBuilder::new(config.fec_group_size).ok()
        } else {
            None
        };
        Self {
            config,
            transport,
            session_id: rand::random(),
            running: AtomicBool::new(false),
            next_packet_id: AtomicU64::new(0),
            next_probe_id: AtomicU64::new(0),
            last_probe_ns: AtomicU64::new(0),
            fec: Mutex::new(fec),
            pending: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            clock: Mutex::new(ClockSync::default()),
            counters: Counters::default(),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn start(&self) -> StreamResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.transport.open() {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }
        info!("network session {:08x} started", self.session_id);
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.transport.close();
        let abandoned = {
            let mut pending = lock(&self.pending);
            let n = pending.len();
            pending.clear();
            n
        };
        lock(&self.probes).clear();
        *lock(&self.clock) = ClockSync::default();
        let stats = self.stats();
        info!(
            "network session {:08x} stopped: {} frames, {} bytes, {} lost, {} unacked at stop",
            self.session_id, stats.frames_sent, stats.bytes_sent, stats.frames_lost, abandoned
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn send_message(&self, message: &Message) -> StreamResult<()> {
        let body = encode_msg(message)?;
        let _order = lock(&self.fec);
        self.send_body(&body)?;
        Ok(())
    }

    fn send_body(&self, body: &[u8]) -> StreamResult<u64> {
        if !self.is_running() {
            return Err(StreamError::NotRunning);
        }
        let packet_id = self.next_packet_id.fetch_add(1, Ordering::SeqCst);
        let packet = PhysicalPacket {
            version: TETHER_VERSION,
            session_id: self.session_id,
            packet_id,
            payload: Bytes::copy_from_slice(body),
        }
        .encode();
        let len = packet.len() as u64;
        self.transport.send(packet)?;
        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(packet_id)
    }

    pub fn send_control(&self, control: ControlMessage) -> StreamResult<()> {
        self.send_message(&Message::Control(control))
    }

    pub fn send_haptic(&self, command: &HapticCommand) -> StreamResult<()> {
        self.send_message(&Message::Haptics(HapticsMessage {
            device_path: command.device.path_id(),
            duration_s: command.duration_s,
            frequency_hz: command.frequency_hz,
            amplitude: command.amplitude,
        }))
    }

    /// Send a latency probe if the probe interval has elapsed.
    pub fn maybe_probe(&self, now_ns: u64) -> StreamResult<bool> {
        let last = self.last_probe_ns.load(Ordering::Relaxed);
        let interval_ns = self.config.probe_interval_ms.saturating_mul(1_000_000);
        if last != 0 && now_ns.saturating_sub(last) < interval_ns {
            return Ok(false);
        }
        self.last_probe_ns.store(now_ns.max(1), Ordering::Relaxed);
        self.send_probe(now_ns)?;
        Ok(true)
    }

    pub fn send_probe(&self, now_ns: u64) -> StreamResult<u64> {
        let probe_id = self.next_probe_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut probes = lock(&self.probes);
            if probes.len() >= MAX_OUTSTANDING_PROBES {
                if let Some(oldest) = probes.keys().min().copied() {
                    probes.remove(&oldest);
                }
            }
            probes.insert(probe_id, now_ns);
        }
        let sent = self.send_control(ControlMessage::Ping {
            probe_id,
            sent_ns: now_ns,
        });
        if let Err(err) = sent {
            lock(&self.probes).remove(&probe_id);
            return Err(err);
        }
        Ok(probe_id)
    }

    /// Reconcile a probe echo against the recorded send time. Each probe is
    /// answered once; unknown and repeated echoes yield `None`.
    pub fn handle_pong(&self, probe_id: u64, now_ns: u64) -> Option<u64> {
        let Some(sent_ns) = lock(&self.probes).remove(&probe_id) else {
            debug!("ignoring stray pong {probe_id}");
            return None;
        };
        let rtt_ns = now_ns.saturating_sub(sent_ns);
        lock(&self.clock).rtt_ns = Some(rtt_ns);
        Some(rtt_ns)
    }

    /// Answer a client probe and fold its timestamp into the clock offset.
    pub fn handle_ping(&self, probe_id: u64, sent_ns: u64, received_ns: u64) -> StreamResult<()> {
        let offset = lock(&self.clock).on_client_ping(sent_ns, received_ns);
        debug!("client clock offset {offset} ns");
        self.send_control(ControlMessage::Pong { probe_id, sent_ns })
    }

    /// Client-to-host clock offset, once a client ping has been seen.
    pub fn clock_offset_ns(&self) -> Option<i64> {
        lock(&self.clock).offset_ns
    }

    /// Translate a client timestamp into host time. Identity until the
    /// first client ping.
    pub fn to_host_time(&self, client_ns: u64) -> u64 {
        match self.clock_offset_ns() {
            Some(offset) => client_ns.saturating_add_signed(offset),
            None => client_ns,
        }
    }

    pub fn handle_ack(&self, frame_index: u64, now_ns: u64) -> Option<FrameFeedback> {
        let Some(pending) = lock(&self.pending).remove(&frame_index) else {
            self.counters.stray_acks.fetch_add(1, Ordering::Relaxed);
            debug!("stray ack for frame {frame_index}");
            return None;
        };
        self.counters.frames_acked.fetch_add(1, Ordering::Relaxed);
        Some(FrameFeedback {
            frame_index,
            encode_time_ns: pending.encode_time_ns,
            transmit_time_ns: pending.transmit_time_ns,
            ack_round_trip_ns: Some(now_ns.saturating_sub(pending.sent_ns)),
            was_lost: false,
        })
    }

    /// The client could not rebuild a frame. Returns loss feedback when the
    /// frame was still awaiting its ack.
    pub fn handle_fec_failure(&self, frame_index: Option<u64>) -> Option<FrameFeedback> {
        self.counters.fec_failures.fetch_add(1, Ordering::Relaxed);
        let frame_index = frame_index?;
        let pending = lock(&self.pending).remove(&frame_index)?;
        self.counters.frames_lost.fetch_add(1, Ordering::Relaxed);
        Some(lost_feedback(frame_index, &pending))
    }

    /// Drop frames whose ack window has passed and report them as lost.
    pub fn expire_pending(&self, now_ns: u64) -> Vec<FrameFeedback> {
        let timeout_ns = self.config.ack_timeout_ms.saturating_mul(1_000_000);
        let mut expired = Vec::new();
        lock(&self.pending).retain(|&frame_index, pending| {
            if now_ns.saturating_sub(pending.sent_ns) > timeout_ns {
                expired.push(lost_feedback(frame_index, pending));
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            self.counters
                .frames_lost
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            debug!("{} frames timed out waiting for ack", expired.len());
            expired.sort_by_key(|f| f.frame_index);
        }
        expired
    }

    pub fn pending_acks(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn stats(&self) -> NetworkStats {
        let c = &self.counters;
        NetworkStats {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            parity_packets_sent: c.parity_packets_sent.load(Ordering::Relaxed),
            frames_acked: c.frames_acked.load(Ordering::Relaxed),
            frames_lost: c.frames_lost.load(Ordering::Relaxed),
            stray_acks: c.stray_acks.load(Ordering::Relaxed),
            fec_failures: c.fec_failures.load(Ordering::Relaxed),
        }
    }

    /// Caller holds the send-order lock.
    fn send_chunks(
        &self,
        chunks: Vec<VideoChunk>,
        mut fec: Option<&mut FecBuilder>,
    ) -> StreamResult<()> {
        for chunk in chunks {
            let body = encode_msg(&Message::Video(chunk))?;
            let packet_id = self.send_body(&body)?;
            if let Some(parity) = fec.as_deref_mut().and_then(|b| b.push(packet_id, &body)) {
                self.send_parity(parity)?;
            }
        }
        if let Some(parity) = fec.and_then(|b| b.finish()) {
            self.send_parity(parity)?;
        }
        Ok(())
    }

    /// Caller holds the send-order lock.
    fn send_parity(&self, parity: FecPacket) -> StreamResult<()> {
        let body = encode_msg(&Message::Fec(parity))?;
        self.send_body(&body)?;
        self.counters
            .parity_packets_sent
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn lost_feedback(frame_index: u64, pending: &PendingFrame) -> FrameFeedback {
    FrameFeedback {
        frame_index,
        encode_time_ns: pending.encode_time_ns,
        transmit_time_ns: pending.transmit_time_ns,
        ack_round_trip_ns: None,
        was_lost: true,
    }
}

impl FrameSink for NetworkSession {
    fn submit_frame(&self, frame: EncodedVideoFrame) -> StreamResult<()> {
        if !self.is_running() {
            return Err(StreamError::NotRunning);
        }
        let encode_us = (frame.encode_time_ns / 1_000).min(u32::MAX as u64) as u32;
        let chunks = chunk_video_payload(
            frame.frame_index,
            frame.presentation_ts_ns,
            frame.keyframe,
            &frame.payload,
            self.config.max_chunk_payload,
            encode_us,
        )?;

        let started = Instant::now();
        {
            let mut fec = lock(&self.fec);
            let sent = self.send_chunks(chunks, fec.as_mut());
            if sent.is_err() {
                // Parity over a torn group would cover other traffic's ids.
                if let Some(builder) = fec.as_mut() {
                    builder.reset();
                }
            }
            sent?;
        }
        let transmit_time_ns = started.elapsed().as_nanos() as u64;

        lock(&self.pending).insert(
            frame.frame_index,
            PendingFrame {
                sent_ns: monotonic_ns(),
                encode_time_ns: frame.encode_time_ns,
                transmit_time_ns,
            },
        );
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl HapticSink for NetworkSession {
    fn forward_haptic(&self, command: &HapticCommand) {
        if let Err(err) = self.send_haptic(command) {
            warn!("dropping haptic pulse for {}: {err}", command.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceId, Pose, PredictedPose};
    use tether_wire::{decode_packet, VideoChunk};

    #[derive(Default)]
    struct LoopbackTransport {
        packets: Mutex<Vec<Bytes>>,
        opened: AtomicU64,
        closed: AtomicU64,
        sends: AtomicU64,
        // 1-based send attempt that fails; 0 never fails.
        fail_on: AtomicU64,
    }

    impl Transport for LoopbackTransport {
        fn open(&self) -> StreamResult<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn send(&self, packet: Bytes) -> StreamResult<()> {
            let attempt = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt == self.fail_on.load(Ordering::SeqCst) {
                return Err(StreamError::Transport("queue full".into()));
            }
            self.packets.lock().unwrap().push(packet);
            Ok(())
        }
    }

    fn session(config: NetworkConfig) -> (NetworkSession, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::default());
        let session = NetworkSession::new(config, transport.clone());
        session.start().unwrap();
        (session, transport)
    }

    fn frame(frame_index: u64, len: usize) -> EncodedVideoFrame {
        EncodedVideoFrame {
            frame_index,
            presentation_ts_ns: 1_000,
            keyframe: frame_index == 0,
            encode_time_ns: 2_000_000,
            head_pose: PredictedPose {
                pose: Pose::IDENTITY,
                timestamp_ns: 1_000,
                stale: true,
            },
            payload: (0..len).map(|i| i as u8).collect(),
        }
    }

    fn decoded(transport: &LoopbackTransport) -> Vec<(u64, Message)> {
        transport
            .packets
            .lock()
            .unwrap()
            .iter()
            .map(|p| {
                let (packet, msg) = decode_packet(p.clone()).unwrap();
                (packet.packet_id, msg)
            })
            .collect()
    }

    #[test]
    fn test_start_stop_idempotent() {
        let (session, transport) = session(NetworkConfig::default());
        session.start().unwrap();
        session.stop();
        session.stop();
        assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            session.submit_frame(frame(0, 10)),
            Err(StreamError::NotRunning)
        ));
    }

    #[test]
    fn test_frame_is_chunked_with_boundaries_and_parity() {
        let config = NetworkConfig {
            max_chunk_payload: 100,
            fec_group_size: 4,
            ..NetworkConfig::default()
        };
        let (session, transport) = session(config);
        session.submit_frame(frame(0, 450)).unwrap();

        let messages = decoded(&transport);
        let chunks: Vec<&VideoChunk> = messages
            .iter()
            .filter_map(|(_, m)| match m {
                Message::Video(c) => Some(c),
                _ => None,
            })
            .collect();
        let parity = messages
            .iter()
            .filter(|(_, m)| matches!(m, Message::Fec(_)))
            .count();
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.chunk_count == 5 && c.frame_index == 0));
        assert_eq!(chunks[4].payload.len(), 50);
        // One full group of three plus the partial tail group.
        assert_eq!(parity, 2);
        assert_eq!(session.stats().parity_packets_sent, 2);
        assert_eq!(session.pending_acks(), 1);
    }

    #[test]
    fn test_lost_chunk_recovered_from_parity() {
        let config = NetworkConfig {
            max_chunk_payload: 64,
            fec_group_size: 8,
            ..NetworkConfig::default()
        };
        let (session, transport) = session(config);
        session.submit_frame(frame(3, 200)).unwrap();

        let packets: HashMap<u64, Vec<u8>> = transport
            .packets
            .lock()
            .unwrap()
            .iter()
            .map(|p| {
                let packet = PhysicalPacket::decode(p.clone()).unwrap();
                (packet.packet_id, packet.payload.to_vec())
            })
            .collect();
        let parity: FecPacket = decoded(&transport)
            .into_iter()
            .find_map(|(_, m)| match m {
                Message::Fec(p) => Some(p),
                _ => None,
            })
            .unwrap();

        let lost = parity.first_packet_id + 1;
        let (id, body) = parity
            .recover(|id| {
                (id != lost)
                    .then(|| packets.get(&id).map(|b| b.as_slice()))
                    .flatten()
            })
            .unwrap();
        assert_eq!(id, lost);
        assert_eq!(body, packets[&lost]);
    }

    #[test]
    fn test_ack_yields_feedback_and_stray_acks_are_counted() {
        let (session, _) = session(NetworkConfig::default());
        session.submit_frame(frame(7, 10)).unwrap();
        let now = monotonic_ns() + 5_000_000;
        let feedback = session.handle_ack(7, now).unwrap();
        assert!(!feedback.was_lost);
        assert_eq!(feedback.encode_time_ns, 2_000_000);
        assert!(feedback.ack_round_trip_ns.unwrap() >= 5_000_000);

        assert!(session.handle_ack(7, now).is_none());
        assert!(session.handle_ack(99, now).is_none());
        assert_eq!(session.stats().stray_acks, 2);
        assert_eq!(session.stats().frames_acked, 1);
    }

    #[test]
    fn test_unacked_frames_expire_as_lost() {
        let config = NetworkConfig {
            ack_timeout_ms: 100,
            ..NetworkConfig::default()
        };
        let (session, _) = session(config);
        session.submit_frame(frame(1, 10)).unwrap();
        session.submit_frame(frame(2, 10)).unwrap();
        let now = monotonic_ns();
        assert!(session.expire_pending(now).is_empty());

        let expired = session.expire_pending(now + 200_000_000);
        assert_eq!(expired.len(), 2);
        assert!(expired.iter().all(|f| f.was_lost));
        assert_eq!(expired[0].frame_index, 1);
        assert_eq!(session.pending_acks(), 0);
        // A late ack for an expired frame is stray.
        assert!(session.handle_ack(1, now + 300_000_000).is_none());
        assert_eq!(session.stats().frames_lost, 2);
    }

    #[test]
    fn test_fec_failure_marks_pending_frame_lost() {
        let (session, _) = session(NetworkConfig::default());
        session.submit_frame(frame(4, 10)).unwrap();
        let feedback = session.handle_fec_failure(Some(4)).unwrap();
        assert!(feedback.was_lost);
        assert!(session.handle_fec_failure(None).is_none());
        assert_eq!(session.stats().fec_failures, 2);
    }

    #[test]
    fn test_probe_round_trip() {
        let (session, transport) = session(NetworkConfig::default());
        assert!(session.maybe_probe(1_000_000).unwrap());
        assert!(!session.maybe_probe(2_000_000).unwrap());
        let (probe_id, sent_ns) = match decoded(&transport).remove(0) {
            (_, Message::Control(ControlMessage::Ping { probe_id, sent_ns })) => (probe_id, sent_ns),
            other => panic!("expected ping, got {other:?}"),
        };
        assert_eq!(sent_ns, 1_000_000);
        assert_eq!(session.handle_pong(probe_id, 4_000_000), Some(3_000_000));
        assert_eq!(session.handle_pong(probe_id + 10, 4_000_000), None);
    }

    #[test]
    fn test_repeated_pong_is_counted_once() {
        let (session, _) = session(NetworkConfig::default());
        let probe_id = session.send_probe(1_000_000).unwrap();
        assert_eq!(session.handle_pong(probe_id, 3_000_000), Some(2_000_000));
        assert_eq!(session.handle_pong(probe_id, 9_000_000), None);
    }

    #[test]
    fn test_outstanding_probes_are_bounded() {
        let (session, _) = session(NetworkConfig::default());
        let first = session.send_probe(1).unwrap();
        for i in 0..MAX_OUTSTANDING_PROBES as u64 {
            session.send_probe(2 + i).unwrap();
        }
        assert_eq!(lock(&session.probes).len(), MAX_OUTSTANDING_PROBES);
        assert_eq!(session.handle_pong(first, 100), None);
    }

    #[test]
    fn test_client_ping_sets_clock_offset() {
        let (session, transport) = session(NetworkConfig::default());
        assert_eq!(session.clock_offset_ns(), None);
        assert_eq!(session.to_host_time(42), 42);

        // 4 ms round trip, so 2 ms one way.
        let probe_id = session.send_probe(1_000_000).unwrap();
        session.handle_pong(probe_id, 5_000_000).unwrap();

        let client_sent = 90_000_000_000;
        session.handle_ping(3, client_sent, 12_000_000).unwrap();
        assert_eq!(session.clock_offset_ns(), Some(-89_990_000_000));
        assert_eq!(session.to_host_time(client_sent + 1_000), 10_001_000);

        let pong = decoded(&transport).pop().unwrap().1;
        assert_eq!(
            pong,
            Message::Control(ControlMessage::Pong {
                probe_id: 3,
                sent_ns: client_sent,
            })
        );

        // Later samples are smoothed in.
        session
            .handle_ping(4, client_sent, 12_000_000 + 8_000)
            .unwrap();
        assert_eq!(session.clock_offset_ns(), Some(-89_989_999_000));

        session.stop();
        assert_eq!(session.clock_offset_ns(), None);
    }

    #[test]
    fn test_send_error_mid_frame_discards_parity_group() {
        let config = NetworkConfig {
            max_chunk_payload: 50,
            fec_group_size: 8,
            ..NetworkConfig::default()
        };
        let (session, transport) = session(config);
        transport.fail_on.store(2, Ordering::SeqCst);

        assert!(matches!(
            session.submit_frame(frame(0, 200)),
            Err(StreamError::Transport(_))
        ));
        assert_eq!(session.pending_acks(), 0);
        session.send_probe(1_000_000).unwrap();
        session.submit_frame(frame(1, 100)).unwrap();

        let messages = decoded(&transport);
        let frame1_ids: Vec<u64> = messages
            .iter()
            .filter_map(|(id, m)| match m {
                Message::Video(c) if c.frame_index == 1 => Some(*id),
                _ => None,
            })
            .collect();
        let parity: Vec<&FecPacket> = messages
            .iter()
            .filter_map(|(_, m)| match m {
                Message::Fec(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(frame1_ids, vec![3, 4]);
        assert_eq!(parity.len(), 1);
        assert_eq!(parity[0].first_packet_id, 3);
        assert_eq!(parity[0].shard_count, 3);
        assert_eq!(parity[0].shard_lengths.len(), 2);
    }

    #[test]
    fn test_haptic_sink_sends_message() {
        let (session, transport) = session(NetworkConfig::default());
        session.forward_haptic(&HapticCommand {
            device: DeviceId::LeftHand,
            duration_s: 0.02,
            frequency_hz: 150.0,
            amplitude: 0.8,
        });
        let (_, msg) = decoded(&transport).remove(0);
        assert_eq!(
            msg,
            Message::Haptics(HapticsMessage {
                device_path: DeviceId::LeftHand.path_id(),
                duration_s: 0.02,
                frequency_hz: 150.0,
                amplitude: 0.8,
            })
        );
    }

    #[test]
    fn test_event_queue_drops_when_full() {
        let (sender, mut rx) = event_queue(2);
        assert!(sender.push(SessionEvent::RequestKeyframe));
        assert!(sender.push(SessionEvent::RequestKeyframe));
        assert!(!sender.push(SessionEvent::RequestKeyframe));
        assert_eq!(sender.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::RequestKeyframe);
    }

    #[test]
    fn test_events_from_client_messages() {
        assert_eq!(
            SessionEvent::from_message(Message::Control(ControlMessage::NetworkLatency {
                latency_us: 12
            })),
            Some(SessionEvent::NetworkLatency { latency_ns: 12_000 })
        );
        assert_eq!(
            SessionEvent::from_message(Message::Control(ControlMessage::FrameAck {
                frame_index: 5
            })),
            Some(SessionEvent::FrameAck { frame_index: 5 })
        );
        assert!(matches!(
            SessionEvent::from_message(Message::Control(ControlMessage::Ping {
                probe_id: 2,
                sent_ns: 77,
            })),
            Some(SessionEvent::Ping {
                probe_id: 2,
                sent_ns: 77,
                ..
            })
        ));
        assert!(SessionEvent::from_message(Message::Haptics(HapticsMessage {
            device_path: 0,
            duration_s: 0.0,
            frequency_hz: 0.0,
            amplitude: 0.0,
        }))
        .is_none());
    }
}
