#![forbid(unsafe_code)]

mod udp;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use tether_common::{env_bool, init_tracing, load_json_config_or_default};
use tether_core::{
    BitrateMode, DeviceId, DeviceSink, Pose, PropertyValue, StreamSession,
    StreamerConfig,
};
use tether_media::{create_encoder, EncoderKind, Resolution, TestPatternCapture};
use tether_wire::ButtonValue;

use crate::udp::{PeerSlot, UdpTransport};

#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "Stream a rendered scene to a VR headset")]
struct Args {
    /// JSON settings file; missing keys take their defaults
    #[arg(long, env = "TETHER_SETTINGS")]
    settings: Option<PathBuf>,

    /// UDP listen address
    #[arg(long, env = "TETHER_LISTEN_ADDR", default_value = "0.0.0.0:9944")]
    listen: SocketAddr,

    /// Headset address. Learned from the first packet when unset.
    #[arg(long, env = "TETHER_PEER_ADDR")]
    peer: Option<SocketAddr>,

    /// Encoder backend (software, nvenc, amf)
    #[arg(long, env = "TETHER_ENCODER", value_parser = parse_encoder)]
    encoder: Option<EncoderKind>,

    /// Display refresh rate in Hz
    #[arg(long)]
    refresh_hz: Option<f32>,

    /// Initial bitrate in Mbps
    #[arg(long, env = "TETHER_BITRATE_MBPS")]
    bitrate_mbps: Option<u64>,

    /// Upper bound for the adaptive controller in Mbps
    #[arg(long)]
    max_bitrate_mbps: Option<u64>,

    /// Hold the bitrate constant instead of adapting it
    #[arg(long, default_value_t = false)]
    fixed_bitrate: bool,

    /// Generic trackers to register besides head and hands
    #[arg(long)]
    trackers: Option<u32>,

    /// Seconds between stats log lines
    #[arg(long, default_value_t = 10)]
    stats_interval_secs: u64,
}

fn parse_encoder(value: &str) -> Result<EncoderKind, String> {
    match value.to_ascii_lowercase().as_str() {
        "software" => Ok(EncoderKind::Software),
        "nvenc" => Ok(EncoderKind::Nvenc),
        "amf" => Ok(EncoderKind::Amf),
        other => Err(format!("unknown encoder '{other}'")),
    }
}

fn load_config(args: &Args) -> Result<StreamerConfig> {
    let mut config: StreamerConfig = load_json_config_or_default(args.settings.as_deref())
        .context("failed to load settings")?;

    if let Some(encoder) = args.encoder {
        config.video.encoder = encoder;
    }
    if let Some(refresh_hz) = args.refresh_hz {
        config.video.refresh_hz = refresh_hz;
    }
    if let Some(mbps) = args.bitrate_mbps {
        config.bitrate.initial_bitrate_bps = mbps.saturating_mul(1_000_000);
    }
    if let Some(mbps) = args.max_bitrate_mbps {
        config.bitrate.max_bitrate_bps = mbps.saturating_mul(1_000_000);
    }
    if args.fixed_bitrate {
        config.bitrate.mode = BitrateMode::Fixed;
    }
    if let Some(trackers) = args.trackers {
        config.trackers = trackers;
    }

    config.validate().context("invalid settings")?;
    Ok(config)
}

/// Stands in for the VR runtime: device updates are only logged.
struct LoggingDeviceSink;

impl DeviceSink for LoggingDeviceSink {
    fn report_pose(&self, device: DeviceId, timestamp_ns: u64, pose: &Pose) {
        trace!("{device} pose @ {timestamp_ns}: {:?}", pose.position);
    }

    fn report_battery(&self, device: DeviceId, gauge: f32, is_charging: bool) {
        info!(
            "{device} battery {:.0}%{}",
            gauge * 100.0,
            if is_charging { " (charging)" } else { "" }
        );
    }

    fn report_property(&self, device: DeviceId, container: u64, key: &str, value: &PropertyValue) {
        debug!("{device} [{container}] {key} = {value:?}");
    }

    fn report_button(&self, device: DeviceId, path: u64, value: ButtonValue) {
        trace!("{device} button {path:#x}: {value:?}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = load_config(&args)?;

    let socket = UdpSocket::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("listening on {}", socket.local_addr()?);

    let peer = args.peer.map(PeerSlot::fixed).unwrap_or_default();
    let transport = UdpTransport::new(socket, peer);

    let resolution = Resolution {
        width: config.video.width,
        height: config.video.height,
    };
    let encoder = create_encoder(config.video.encoder);
    let session = Arc::new(StreamSession::new(
        config,
        transport.clone(),
        Box::new(TestPatternCapture::new(resolution)),
        encoder,
        Arc::new(LoggingDeviceSink),
    )?);
    transport.spawn_receiver(session.event_sender());
    session.start().context("failed to start stream session")?;

    if env_bool("TETHER_LOG_STATS", true) {
        let session = Arc::clone(&session);
        let period = Duration::from_secs(args.stats_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_stats(&session);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    tokio::task::spawn_blocking(move || session.stop()).await?;
    Ok(())
}

fn log_stats(session: &StreamSession) {
    let pipeline = session.pipeline_stats();
    let network = session.network_stats();
    let bitrate = session.bitrate_state();
    info!(
        "frames={} keyframes={} coalesced={} acked={} lost={} bitrate={:.1}Mbps rtt={:.1}ms trend={:?}",
        pipeline.frames_sent,
        pipeline.keyframes,
        pipeline.ticks_coalesced,
        network.frames_acked,
        network.frames_lost,
        bitrate.current_bitrate_bps as f64 / 1e6,
        bitrate.latency_ema_ns / 1e6,
        bitrate.trend,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_apply_on_top_of_defaults() {
        let args = Args::parse_from([
            "tether-server",
            "--encoder",
            "NVENC",
            "--bitrate-mbps",
            "50",
            "--fixed-bitrate",
            "--trackers",
            "2",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.video.encoder, EncoderKind::Nvenc);
        assert_eq!(config.bitrate.initial_bitrate_bps, 50_000_000);
        assert_eq!(config.bitrate.mode, BitrateMode::Fixed);
        assert_eq!(config.trackers, 2);
        assert_eq!(config.video.refresh_hz, 90.0);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let args = Args::parse_from(["tether-server", "--refresh-hz", "0"]);
        assert!(load_config(&args).is_err());
        assert!(parse_encoder("quicksync").is_err());
    }
}
