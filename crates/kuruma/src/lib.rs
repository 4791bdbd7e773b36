//! Kuruma - USB camera video source for the vehicle-side telemetry link
//!
//! Captures H.264 video from a USB (V4L2) camera by driving an external
//! ffmpeg encoder process and parsing its Annex-B output stream:
//!
//! - **`probe`**: V4L2 capability check for the camera node
//! - **`encoder`**: ffmpeg child-process supervision (spawn, SIGTERM →
//!   SIGKILL termination)
//! - **`nal`**: NAL unit types and the Annex-B stream scanner
//! - **`ring`**: fixed-capacity drop-oldest NAL queue
//! - **`source`**: the `UsbVideoSource` facade: start/stop/read plus
//!   periodic health checks with automatic restart
//!
//! The `test-source` feature lets the pipeline run against an arbitrary
//! command instead of ffmpeg plus real hardware.

pub mod config;
pub mod encoder;
pub mod nal;
pub mod probe;
pub mod ring;
pub mod source;
mod worker;

// Re-export commonly used types
pub use config::SourceConfig;
pub use nal::{contains_keyframe, AnnexBScanner, NalRecord, NalUnitType, MAX_NAL_SIZE};
pub use ring::{NalRing, RING_CAPACITY};
pub use source::{LastRead, SourceState, StartedParams, UsbVideoSource};
pub use worker::READ_BUFFER_SIZE;
