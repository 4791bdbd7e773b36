//! V4L2 device probing
//!
//! A stateless availability check used before starting the encoder and
//! periodically while running, to distinguish an unplugged camera from a
//! wedged pipeline.

use tracing::{info, warn};
use v4l::capability::Flags;
use v4l::Device;

/// Check that `path` is an openable V4L2 node with the video-capture
/// capability. The device is opened, queried, and closed again; no state
/// is retained, so this is safe to call from any thread at any time.
pub fn probe(path: &str) -> bool {
    let device = match Device::with_path(path) {
        Ok(device) => device,
        Err(e) => {
            warn!("Video device {} not available: {}", path, e);
            return false;
        }
    };

    let caps = match device.query_caps() {
        Ok(caps) => caps,
        Err(e) => {
            warn!("{} is not a V4L2 device: {}", path, e);
            return false;
        }
    };

    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        warn!("{} does not support video capture", path);
        return false;
    }

    info!("Found V4L2 device {}: {} ({})", path, caps.card, caps.driver);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_is_unavailable() {
        assert!(!probe("/definitely/not/a/video/device"));
    }

    #[test]
    fn non_v4l2_node_is_unavailable() {
        // /dev/null opens fine but rejects the capability ioctl.
        assert!(!probe("/dev/null"));
    }
}
