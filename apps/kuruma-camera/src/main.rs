//! Kuruma camera binary
//!
//! Runs the USB video source on the vehicle and drains its NAL stream.
//! The downstream packetizer attaches where the drain loop consumes
//! records; this binary keeps session statistics in its place.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: /dev/video0, 1280x720 @ 30fps, 4 Mbps, 2s keyframes
//! kuruma-camera
//!
//! # Override via environment
//! KURUMA_DEVICE=/dev/video2 KURUMA_BITRATE=2000000 kuruma-camera
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use tracing::{info, warn};

use kuruma::{SourceConfig, UsbVideoSource};

const HEALTH_INTERVAL: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_SLEEP: Duration = Duration::from_millis(5);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kuruma=info".parse().unwrap()),
        )
        .init();

    let config = SourceConfig::from_env();

    info!("Kuruma camera starting");
    info!("  Device: {}", config.device);
    info!(
        "  Video: {}x{} @ {}fps",
        config.width, config.height, config.fps
    );
    info!(
        "  Bitrate: {:.2} Mbps, keyframe {} ms",
        f64::from(config.bitrate_bps) / 1_000_000.0,
        config.keyframe_ms
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;

    let mut source = UsbVideoSource::new(config);
    let params = source
        .start(None, None)
        .context("failed to start USB camera capture")?;
    info!(
        "Capture running at {} bps (keyframe {} ms)",
        params.bitrate_bps, params.keyframe_ms
    );

    let mut session_nals = 0u64;
    let mut session_keyframes = 0u64;
    let mut session_bytes = 0u64;
    let mut last_health = Instant::now();
    let mut last_stats = Instant::now();
    let session_start = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        let mut drained = false;
        while let Some(record) = source.read() {
            drained = true;
            session_nals += 1;
            session_bytes += record.size() as u64;
            if record.nal_type.is_keyframe() {
                session_keyframes += 1;
            }
            // Downstream packetizer hookup goes here.
        }
        if !drained {
            thread::sleep(IDLE_SLEEP);
        }

        if last_health.elapsed() >= HEALTH_INTERVAL {
            last_health = Instant::now();
            if !source.periodic_health_checks() {
                warn!("Health check failed (state: {:?})", source.state());
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            let elapsed = session_start.elapsed().as_secs_f64();
            let mbps = session_bytes as f64 * 8.0 / (elapsed * 1_000_000.0);
            info!(
                "Session: {} NALs ({} keyframes), {:.2} Mbps average",
                session_nals, session_keyframes, mbps
            );
        }
    }

    info!("Shutting down");
    source.stop();
    info!(
        "Session total: {} NALs ({} keyframes), {} bytes",
        session_nals, session_keyframes, session_bytes
    );

    Ok(())
}
