#![forbid(unsafe_code)]

pub mod bitrate;
pub mod config;
pub mod haptics;
pub mod network;
pub mod pipeline;
pub mod pose_history;
pub mod registry;
pub mod stream;
pub mod types;

pub use bitrate::{
    BitrateConfig, BitrateController, BitrateMode, BitrateState, BitrateTrend, FrameFeedback,
    SharedBitrate,
};
pub use config::{StreamerConfig, VideoConfig};
pub use haptics::{HapticShaper, HapticsConfig};
pub use network::{
    event_queue, EventSender, NetworkConfig, NetworkSession, NetworkStats, SessionEvent,
    Transport,
};
pub use pipeline::{
    CycleOutcome, EncodePipeline, FrameJob, FrameSink, PipelineConfig, PipelineStage,
    PipelineStats,
};
pub use pose_history::{PoseConfig, PoseHistory};
pub use registry::{DeviceRecord, DeviceRegistry, DeviceSink, HapticSink, PropertyValue};
pub use stream::StreamSession;
pub use types::{DeviceId, EncodedVideoFrame, HapticCommand, Pose, PoseSample, PredictedPose};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Config(#[from] tether_common::Error),
    #[error("media error: {0}")]
    Media(#[from] tether_media::MediaError),
    #[error("wire error: {0}")]
    Wire(#[from] tether_wire::WireError),
    #[error("chunking error: {0}")]
    Chunk(#[from] tether_wire::ChunkError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not running")]
    NotRunning,
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
