//! Encoder child-process supervision
//!
//! Spawns ffmpeg reading the V4L2 device and emitting a raw Annex-B H.264
//! stream on stdout, and owns the child through its whole lifetime:
//! graceful termination first (SIGTERM with a bounded wait), forceful
//! (SIGKILL plus a blocking reap) only if the child ignores it. The goal is
//! to never leave a zombie process or an orphaned pipe behind, on any path.

use std::os::fd::AsRawFd;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STOP_POLL_ATTEMPTS: u32 = 10;

/// Build the ffmpeg argument list for `config`.
///
/// MJPEG input is requested because it is the format USB cameras most
/// reliably deliver at full frame rate; `ultrafast`/`zerolatency` keep the
/// encoder from buffering frames.
pub fn encoder_args(config: &SourceConfig) -> Vec<String> {
    let bitrate = config.bitrate_bps.to_string();
    let gop = config.keyframe_frames().to_string();

    vec![
        "-f".to_string(),
        "v4l2".to_string(),
        "-input_format".to_string(),
        "mjpeg".to_string(),
        "-video_size".to_string(),
        format!("{}x{}", config.width, config.height),
        "-framerate".to_string(),
        config.fps.to_string(),
        "-i".to_string(),
        config.device.clone(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "ultrafast".to_string(),
        "-tune".to_string(),
        "zerolatency".to_string(),
        "-b:v".to_string(),
        bitrate.clone(),
        "-maxrate".to_string(),
        bitrate.clone(),
        "-bufsize".to_string(),
        bitrate,
        "-g".to_string(),
        gop.clone(),
        "-keyint_min".to_string(),
        gop,
        "-sc_threshold".to_string(),
        "0".to_string(),
        "-profile:v".to_string(),
        "baseline".to_string(),
        "-level".to_string(),
        "4.0".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-f".to_string(),
        "h264".to_string(),
        "-".to_string(),
    ]
}

/// Handle to the running encoder child process.
///
/// Dropping the handle runs the same graceful/forceful stop sequence, so
/// the child cannot leak along error paths in the controller.
pub struct EncoderProcess {
    child: Child,
}

impl EncoderProcess {
    /// Spawn ffmpeg for `config`.
    ///
    /// Returns the supervisor handle and the pipe read end, already set
    /// non-blocking. The child's stderr goes to a null sink: ffmpeg logs
    /// its progress there continuously and would otherwise fill the pipe.
    pub fn spawn(config: &SourceConfig) -> Result<(Self, ChildStdout)> {
        let args = encoder_args(config);
        info!("Starting encoder: ffmpeg {}", args.join(" "));

        let mut command = Command::new("ffmpeg");
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        Self::spawn_command(command)
    }

    /// Spawn an arbitrary command as the stream producer.
    pub(crate) fn spawn_command(mut command: Command) -> Result<(Self, ChildStdout)> {
        let child = command.spawn().context("failed to spawn encoder process")?;
        let mut process = Self { child };

        let stdout = match process.child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                process.stop();
                anyhow::bail!("encoder stdout was not piped");
            }
        };
        if let Err(e) = set_nonblocking(&stdout) {
            process.stop();
            return Err(e);
        }

        info!("Encoder process started, pid {}", process.child.id());
        Ok((process, stdout))
    }

    /// OS process id of the child.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking liveness check. Returns the exit status once the child
    /// has terminated and been reaped.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Terminate the child: SIGTERM, up to 500 ms of non-blocking reap
    /// polls, then SIGKILL and a blocking reap. Failures are logged, never
    /// propagated; there is nothing a caller could do with them.
    pub fn stop(&mut self) {
        let pid = Pid::from_raw(self.child.id() as i32);
        debug!("Stopping encoder process, pid {}", pid);

        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!("SIGTERM to encoder failed: {}", e);
        }

        for _ in 0..STOP_POLL_ATTEMPTS {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    info!("Encoder terminated gracefully ({})", status);
                    return;
                }
                Ok(None) => thread::sleep(STOP_POLL_INTERVAL),
                Err(e) => {
                    warn!("Failed to reap encoder: {}", e);
                    break;
                }
            }
        }

        warn!("Encoder ignored SIGTERM, sending SIGKILL");
        if let Err(e) = self.child.kill() {
            warn!("SIGKILL to encoder failed: {}", e);
        }
        match self.child.wait() {
            Ok(status) => info!("Encoder terminated ({})", status),
            Err(e) => warn!("Failed to reap encoder after SIGKILL: {}", e),
        }
    }
}

impl Drop for EncoderProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None) | Err(_)) {
            self.stop();
        }
    }
}

fn set_nonblocking(stdout: &ChildStdout) -> Result<()> {
    let fd = stdout.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL).context("F_GETFL on encoder pipe")?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).context("F_SETFL on encoder pipe")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command
            .args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        command
    }

    #[test]
    fn args_carry_encoding_parameters() {
        let config = SourceConfig {
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_bps: 4_000_000,
            keyframe_ms: 2_000,
            ..Default::default()
        };
        let args = encoder_args(&config);

        assert!(args.contains(&"1280x720".to_string()));
        assert!(args.contains(&"ultrafast".to_string()));
        assert!(args.contains(&"zerolatency".to_string()));

        let window = |flag: &str, value: &str| {
            args.windows(2)
                .any(|pair| pair[0] == flag && pair[1] == value)
        };
        assert!(window("-g", "60"));
        assert!(window("-keyint_min", "60"));
        assert!(window("-b:v", "4000000"));
        assert!(window("-maxrate", "4000000"));
        assert!(window("-bufsize", "4000000"));
        assert!(window("-i", "/dev/video0"));

        // Output goes to stdout.
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn cooperative_child_terminates_on_sigterm() {
        let (mut process, _stdout) = EncoderProcess::spawn_command(shell("sleep 30")).unwrap();
        let started = Instant::now();
        process.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(process.try_wait().is_some());
    }

    #[test]
    fn stubborn_child_is_killed_within_bound() {
        // The child ignores SIGTERM, so stop() must escalate to SIGKILL
        // after the ~500 ms grace period and still reap it.
        let script = "trap '' TERM; while :; do sleep 1; done";
        let (mut process, _stdout) = EncoderProcess::spawn_command(shell(script)).unwrap();
        let started = Instant::now();
        process.stop();
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(process.try_wait().is_some());
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut process, _stdout) = EncoderProcess::spawn_command(shell("sleep 30")).unwrap();
        process.stop();
        process.stop();
        assert!(process.try_wait().is_some());
    }

    #[test]
    fn pipe_read_end_is_nonblocking() {
        use std::io::Read;

        // A silent child: a blocking descriptor would hang this read.
        let (mut process, mut stdout) =
            EncoderProcess::spawn_command(shell("sleep 30")).unwrap();
        let mut buf = [0u8; 16];
        let err = stdout.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
        process.stop();
    }
}
