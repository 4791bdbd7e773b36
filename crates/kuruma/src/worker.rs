//! Capture worker
//!
//! A dedicated thread that moves bytes from the encoder pipe through the
//! Annex-B scanner into the NAL ring. The worker tolerates transient read
//! faults (interrupts, would-block). Terminal ones (pipe hangup, pipe
//! error, EOF) flip the shared state to `Error` and end the thread. It
//! never restarts anything itself; recovery belongs to the controller's
//! health checks.

use std::io::Read;
use std::os::fd::AsFd;
use std::process::ChildStdout;
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{error, info};

use crate::nal::{AnnexBScanner, NalRecord};
use crate::ring::NalRing;
use crate::source::{SharedState, SourceState};

/// Size of one pipe read (256 KiB), enough for a full encoder burst.
pub const READ_BUFFER_SIZE: usize = 256 * 1024;

const POLL_TIMEOUT_MS: u8 = 10;

/// Worker loop. Runs until the stop flag is set or the pipe dies.
pub(crate) fn run(mut stdout: ChildStdout, ring: Arc<NalRing>, shared: Arc<SharedState>) {
    info!("Capture worker started");

    let mut scanner = AnnexBScanner::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    while !shared.stop_requested() {
        if shared.take_scanner_reset() {
            scanner.reset();
        }

        let (ready, revents) = {
            let mut fds = [PollFd::new(stdout.as_fd(), PollFlags::POLLIN)];
            let ready = poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS));
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            (ready, revents)
        };

        match ready {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("Poll error on encoder pipe: {}", e);
                shared.bump_read_errors();
                continue;
            }
            Ok(0) => continue,
            Ok(_) => {}
        }

        if !revents.contains(PollFlags::POLLIN) {
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                error!("Encoder pipe error/hangup");
                shared.set_state(SourceState::Error);
                break;
            }
            continue;
        }

        let n = match stdout.read(&mut buf) {
            Ok(0) => {
                info!("Encoder pipe closed (EOF)");
                shared.set_state(SourceState::Error);
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Encoder pipe read error: {}", e);
                shared.bump_read_errors();
                continue;
            }
        };

        shared.clear_read_errors();
        shared.record_read(n);

        for bytes in scanner.feed(&buf[..n]) {
            if let Some(record) = NalRecord::from_annexb(bytes, shared.now_ms()) {
                ring.write(record);
            }
        }
    }

    // The stream may end mid-NAL; emit whatever payload accumulated.
    if let Some(bytes) = scanner.flush() {
        if let Some(record) = NalRecord::from_annexb(bytes, shared.now_ms()) {
            ring.write(record);
        }
    }

    shared.set_worker_running(false);
    info!("Capture worker ended");
}
