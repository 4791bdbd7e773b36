//! Capture configuration

use std::env;

/// Default V4L2 device node for USB cameras.
pub const DEFAULT_DEVICE: &str = "/dev/video0";
/// Default frame width in pixels.
pub const DEFAULT_WIDTH: u32 = 1280;
/// Default frame height in pixels.
pub const DEFAULT_HEIGHT: u32 = 720;
/// Default frames per second.
pub const DEFAULT_FPS: u32 = 30;
/// Default encoding bitrate in bits per second.
pub const DEFAULT_BITRATE_BPS: u32 = 4_000_000;
/// Default keyframe period in milliseconds (2 seconds).
pub const DEFAULT_KEYFRAME_MS: u32 = 2_000;

/// Video source configuration
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// V4L2 device node path
    pub device: String,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Target bitrate in bits per second
    pub bitrate_bps: u32,
    /// Keyframe period in milliseconds (0 = encoder default of 2s worth of frames)
    pub keyframe_ms: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            bitrate_bps: DEFAULT_BITRATE_BPS,
            keyframe_ms: DEFAULT_KEYFRAME_MS,
        }
    }
}

impl SourceConfig {
    /// Load configuration from `KURUMA_*` environment variables, falling
    /// back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let device = env::var("KURUMA_DEVICE").unwrap_or_else(|_| DEFAULT_DEVICE.to_string());

        let width = env::var("KURUMA_WIDTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_WIDTH);

        let height = env::var("KURUMA_HEIGHT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HEIGHT);

        let fps = env::var("KURUMA_FPS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_FPS);

        let bitrate_bps = env::var("KURUMA_BITRATE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BITRATE_BPS);

        let keyframe_ms = env::var("KURUMA_KEYFRAME_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_KEYFRAME_MS);

        Self {
            device,
            width,
            height,
            fps,
            bitrate_bps,
            keyframe_ms,
        }
    }

    /// Keyframe period converted to frames for the encoder's GOP settings.
    ///
    /// Rounds `keyframe_ms × fps / 1000` with a floor of one frame; a zero
    /// period selects two seconds' worth of frames.
    pub fn keyframe_frames(&self) -> u32 {
        if self.keyframe_ms == 0 {
            return self.fps * 2;
        }
        let frames = (u64::from(self.keyframe_ms) * u64::from(self.fps) + 500) / 1000;
        (frames as u32).max(1)
    }
}
