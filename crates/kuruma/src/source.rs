//! USB video source controller
//!
//! The public facade over the capture pipeline: probe the device, spawn the
//! encoder, run the capture worker, hand NAL records to the consumer, and
//! watch the whole thing for faults. One `UsbVideoSource` owns every
//! resource the pipeline uses, so dropping it (or calling [`stop`]) releases
//! the worker thread, the encoder child, and the pipe.
//!
//! [`stop`]: UsbVideoSource::stop

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::SourceConfig;
use crate::encoder::EncoderProcess;
use crate::nal::{NalRecord, NalUnitType};
use crate::probe;
use crate::ring::NalRing;
use crate::worker;

/// Delay after spawning the encoder before reading from it, giving ffmpeg
/// time to open the device and produce its first output.
const ENCODER_WARMUP: Duration = Duration::from_millis(200);

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const JOIN_POLL_ATTEMPTS: u32 = 50;
const RESTART_SETTLE: Duration = Duration::from_millis(500);

const STATS_INTERVAL_MS: u64 = 5_000;
const PROBE_INTERVAL_MS: u64 = 10_000;
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 100;

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SourceState {
    Stopped,
    Starting,
    Running,
    Error,
    DeviceLost,
}

impl SourceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SourceState::Stopped,
            1 => SourceState::Starting,
            2 => SourceState::Running,
            3 => SourceState::Error,
            _ => SourceState::DeviceLost,
        }
    }
}

/// State shared between the controller thread and the capture worker.
///
/// The worker is the only writer of the stats counters and the running
/// flag; the controller is the only writer of the stop flag. The state enum
/// is written by both (the worker only for its ERROR transitions).
pub(crate) struct SharedState {
    epoch: Instant,
    state: AtomicU8,
    stop: AtomicBool,
    worker_running: AtomicBool,
    scanner_reset: AtomicBool,
    consecutive_read_errors: AtomicU32,
    stats_bytes: AtomicU64,
    stats_reads: AtomicU64,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            state: AtomicU8::new(SourceState::Stopped as u8),
            stop: AtomicBool::new(false),
            worker_running: AtomicBool::new(false),
            scanner_reset: AtomicBool::new(false),
            consecutive_read_errors: AtomicU32::new(0),
            stats_bytes: AtomicU64::new(0),
            stats_reads: AtomicU64::new(0),
        }
    }

    /// Monotonic milliseconds since this source was created.
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn worker_running(&self) -> bool {
        self.worker_running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_worker_running(&self, running: bool) {
        self.worker_running.store(running, Ordering::SeqCst);
    }

    fn request_scanner_reset(&self) {
        self.scanner_reset.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_scanner_reset(&self) -> bool {
        self.scanner_reset.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn bump_read_errors(&self) {
        self.consecutive_read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn clear_read_errors(&self) {
        self.consecutive_read_errors.store(0, Ordering::Relaxed);
    }

    fn read_errors(&self) -> u32 {
        self.consecutive_read_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.stats_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.stats_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Take and reset the throughput counters.
    fn take_stats(&self) -> (u64, u64) {
        (
            self.stats_bytes.swap(0, Ordering::Relaxed),
            self.stats_reads.swap(0, Ordering::Relaxed),
        )
    }

    fn reset_for_start(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.scanner_reset.store(false, Ordering::SeqCst);
        self.consecutive_read_errors.store(0, Ordering::Relaxed);
        self.stats_bytes.store(0, Ordering::Relaxed);
        self.stats_reads.store(0, Ordering::Relaxed);
    }
}

/// Parameters actually applied by a successful [`UsbVideoSource::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedParams {
    pub bitrate_bps: u32,
    pub keyframe_ms: u32,
}

/// Metadata describing the most recently read NAL record.
#[derive(Debug, Clone, Copy)]
pub struct LastRead {
    pub nal_type: NalUnitType,
    pub is_start_nal: bool,
    pub is_end_nal: bool,
    /// Records always hold exactly one NAL unit.
    pub is_single_nal: bool,
}

/// USB camera video source.
pub struct UsbVideoSource {
    config: SourceConfig,
    shared: Arc<SharedState>,
    ring: Arc<NalRing>,
    encoder: Option<EncoderProcess>,
    worker: Option<JoinHandle<()>>,
    started_at_ms: u64,
    last_read: Option<LastRead>,
    last_stats_ms: u64,
    last_probe_ms: u64,
}

impl UsbVideoSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            shared: Arc::new(SharedState::new()),
            ring: Arc::new(NalRing::new()),
            encoder: None,
            worker: None,
            started_at_ms: 0,
            last_read: None,
            last_stats_ms: 0,
            last_probe_ms: 0,
        }
    }

    /// Probe the device, start the encoder, and spawn the capture worker.
    ///
    /// `bitrate_bps` and `keyframe_ms` override the configured values when
    /// given; `None` keeps the current ones, which is also how a restart
    /// retains its parameters. On failure the state is left at `Error`.
    pub fn start(
        &mut self,
        bitrate_bps: Option<u32>,
        keyframe_ms: Option<u32>,
    ) -> Result<StartedParams> {
        if self.encoder.is_some() || self.worker.is_some() {
            anyhow::bail!("capture already started");
        }

        info!("Starting USB camera capture");
        self.shared.set_state(SourceState::Starting);

        if let Some(bitrate) = bitrate_bps.filter(|b| *b > 0) {
            self.config.bitrate_bps = bitrate;
        }
        if let Some(keyframe) = keyframe_ms.filter(|k| *k > 0) {
            self.config.keyframe_ms = keyframe;
        }
        info!(
            "Capture settings: {:.2} Mbps, keyframe {} ms",
            f64::from(self.config.bitrate_bps) / 1_000_000.0,
            self.config.keyframe_ms
        );

        if !probe::probe(&self.config.device) {
            error!("USB camera device not available");
            self.shared.set_state(SourceState::Error);
            anyhow::bail!("device {} is not available", self.config.device);
        }

        let (encoder, stdout) = match EncoderProcess::spawn(&self.config) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Failed to start encoder: {:#}", e);
                self.shared.set_state(SourceState::Error);
                return Err(e);
            }
        };

        thread::sleep(ENCODER_WARMUP);

        self.launch(encoder, stdout)?;
        info!("USB camera capture running");
        Ok(StartedParams {
            bitrate_bps: self.config.bitrate_bps,
            keyframe_ms: self.config.keyframe_ms,
        })
    }

    /// Start the pipeline against an arbitrary stream-producing command
    /// instead of ffmpeg plus a camera. The command must pipe its stdout.
    #[cfg(any(test, feature = "test-source"))]
    pub fn start_with_command(&mut self, command: std::process::Command) -> Result<StartedParams> {
        if self.encoder.is_some() || self.worker.is_some() {
            anyhow::bail!("capture already started");
        }
        self.shared.set_state(SourceState::Starting);

        let (encoder, stdout) = match EncoderProcess::spawn_command(command) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.shared.set_state(SourceState::Error);
                return Err(e);
            }
        };

        self.launch(encoder, stdout)?;
        Ok(StartedParams {
            bitrate_bps: self.config.bitrate_bps,
            keyframe_ms: self.config.keyframe_ms,
        })
    }

    fn launch(
        &mut self,
        encoder: EncoderProcess,
        stdout: std::process::ChildStdout,
    ) -> Result<()> {
        self.ring.clear();
        self.shared.reset_for_start();
        self.shared.set_worker_running(true);

        let ring = Arc::clone(&self.ring);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("usb-capture".to_string())
            .spawn(move || worker::run(stdout, ring, shared));
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to spawn capture worker: {}", e);
                self.shared.set_worker_running(false);
                self.shared.set_state(SourceState::Error);
                // `encoder` drops here, terminating the child.
                return Err(e).context("failed to spawn capture worker");
            }
        };

        self.encoder = Some(encoder);
        self.worker = Some(handle);
        self.started_at_ms = self.shared.now_ms();
        self.last_stats_ms = self.started_at_ms;
        self.last_probe_ms = self.started_at_ms;
        self.shared.set_state(SourceState::Running);
        Ok(())
    }

    /// Stop the worker, terminate the encoder, and drop all buffered data.
    /// Safe to call in any state; stopping a stopped source is a no-op.
    pub fn stop(&mut self) {
        if self.encoder.is_none() && self.worker.is_none() {
            self.shared.set_state(SourceState::Stopped);
            self.started_at_ms = 0;
            return;
        }

        info!("Stopping USB camera capture");
        self.shared.request_stop();

        if let Some(handle) = self.worker.take() {
            let mut waited = 0;
            while self.shared.worker_running() && waited < JOIN_POLL_ATTEMPTS {
                thread::sleep(JOIN_POLL_INTERVAL);
                waited += 1;
            }
            if self.shared.worker_running() {
                // A std thread cannot be cancelled. The worker never blocks
                // longer than one poll interval, so this path is unreachable
                // short of a worker bug; abandon the handle rather than hang.
                warn!("Capture worker did not stop within 500 ms, abandoning it");
                drop(handle);
            } else if handle.join().is_err() {
                warn!("Capture worker panicked");
            }
        }

        if let Some(mut encoder) = self.encoder.take() {
            encoder.stop();
        }

        self.ring.clear();
        self.shared.set_state(SourceState::Stopped);
        self.started_at_ms = 0;
        info!("USB camera capture stopped");
    }

    /// Take the oldest buffered NAL record.
    ///
    /// Returns `None` unless the pipeline is running and has data. Never
    /// blocks. On success the last-read metadata is updated for inspection
    /// via [`last_read`](Self::last_read).
    pub fn read(&mut self) -> Option<NalRecord> {
        if self.state() != SourceState::Running {
            return None;
        }
        let record = self.ring.read()?;
        self.last_read = Some(LastRead {
            nal_type: record.nal_type,
            is_start_nal: record.is_start_nal,
            is_end_nal: record.is_end_nal,
            is_single_nal: true,
        });
        Some(record)
    }

    /// Metadata of the most recent successful [`read`](Self::read).
    pub fn last_read(&self) -> Option<LastRead> {
        self.last_read
    }

    /// Acknowledge a parameter change. Bitrate and keyframe period cannot
    /// be applied to a running encoder; they take effect on the next
    /// restart, so this is a no-op.
    pub fn apply_all_parameters(&mut self) {
        info!("Parameter changes require a pipeline restart to take effect");
    }

    /// Drop all buffered NAL records and any partially scanned NAL.
    pub fn clear_input_buffers(&mut self) {
        info!("Clearing input buffers");
        self.ring.clear();
        self.shared.request_scanner_reset();
    }

    /// USB thermal cameras carry no audio stream.
    pub fn read_audio(&mut self, _out: &mut [u8]) -> usize {
        0
    }

    pub fn clear_audio_buffers(&mut self) {}

    /// Run the periodic health checks: log throughput stats (~5 s),
    /// reprobe the device (~10 s), reap a dead encoder, restart after an
    /// error, and fail fast on persistent read errors.
    ///
    /// Returns false when the pipeline is unhealthy and could not be
    /// recovered this tick.
    pub fn periodic_health_checks(&mut self) -> bool {
        if self.state() == SourceState::Stopped {
            return true;
        }
        let now = self.shared.now_ms();

        if now.saturating_sub(self.last_stats_ms) >= STATS_INTERVAL_MS {
            let delta_ms = now - self.last_stats_ms;
            let (bytes, reads) = self.shared.take_stats();
            if delta_ms > 0 {
                let mbps = bytes as f64 * 8.0 / delta_ms as f64 / 1000.0;
                info!(
                    "Capture stats: {:.2} Mbps, {} reads in {} ms",
                    mbps, reads, delta_ms
                );
            }
            self.last_stats_ms = now;
        }

        if self.state() == SourceState::Error {
            error!("Camera in error state, attempting restart");
            let bitrate = self.config.bitrate_bps;
            let keyframe = self.config.keyframe_ms;
            self.stop();
            thread::sleep(RESTART_SETTLE);
            return self.start(Some(bitrate), Some(keyframe)).is_ok();
        }

        if let Some(encoder) = self.encoder.as_mut() {
            if let Some(status) = encoder.try_wait() {
                error!("Encoder process died unexpectedly ({})", status);
                self.shared.set_state(SourceState::Error);
                return false;
            }
        }

        if now.saturating_sub(self.last_probe_ms) >= PROBE_INTERVAL_MS {
            self.last_probe_ms = now;
            if !probe::probe(&self.config.device) {
                error!("USB camera device lost");
                self.shared.set_state(SourceState::DeviceLost);
                return false;
            }
        }

        if self.shared.read_errors() > MAX_CONSECUTIVE_READ_ERRORS {
            error!("Too many consecutive read errors on encoder pipe");
            self.shared.set_state(SourceState::Error);
            return false;
        }

        true
    }

    /// Probe the configured device right now.
    pub fn is_available(&self) -> bool {
        probe::probe(&self.config.device)
    }

    pub fn state(&self) -> SourceState {
        self.shared.state()
    }

    /// Monotonic milliseconds at which the pipeline last started, or 0
    /// when stopped.
    pub fn program_start_time_ms(&self) -> u64 {
        self.started_at_ms
    }

    /// The active capture configuration.
    pub fn config(&self) -> &SourceConfig {
        &self.config
    }
}

impl Drop for UsbVideoSource {
    fn drop(&mut self) {
        self.stop();
    }
}
