//! Cooperative relay between a local byte source and the device.
//!
//! [`communicate`] streams local input into the prompt (normally in paste
//! mode) while forwarding device output to a local sink, in one
//! single-threaded readiness-polled loop.  Each iteration runs in a fixed
//! order: local-input readiness → forward to device → drain device output →
//! timeout checks → watch probe.
//!
//! Two timeouts are tracked separately: *idle* (time since the last
//! successful transfer in either direction) and *absolute* (time since the
//! loop started), so a caller can treat them differently.  An optional
//! watch path turns the loop into the engine of a live-reload cycle: when
//! the path's modification time changes, the loop returns
//! [`Outcome::RerunRequested`] instead of running on, and the caller resets
//! the device and re-invokes with the file reopened from the start.

use std::fs;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use bytes::{Buf, Bytes};

use crate::errors::{SyncError, SyncResult};
use crate::repl::{CTRL_EXIT_PASTE, Mode, ReplSession};
use crate::transport::Wire;

/// How long one readiness poll on local input may wait.
const INPUT_POLL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Local input sources
// ---------------------------------------------------------------------------

/// Local input end of the bridge: a byte source with a readiness probe.
pub trait BridgeInput: Read {
    /// Wait up to `wait` for data to become readable.  Sources with a
    /// definite position (regular files) are always ready.
    fn poll_ready(&mut self, wait: Duration) -> SyncResult<bool>;
}

/// A regular file: always ready until EOF.
pub struct FileInput(fs::File);

impl FileInput {
    pub fn open(path: &Path) -> SyncResult<Self> {
        Ok(Self(fs::File::open(path)?))
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl BridgeInput for FileInput {
    fn poll_ready(&mut self, _wait: Duration) -> SyncResult<bool> {
        Ok(true)
    }
}

/// Standard input, polled with `poll(2)` so the loop never blocks on a
/// silent terminal.
pub struct StdinInput(std::io::Stdin);

impl StdinInput {
    pub fn new() -> Self {
        Self(std::io::stdin())
    }
}

impl Read for StdinInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl BridgeInput for StdinInput {
    fn poll_ready(&mut self, wait: Duration) -> SyncResult<bool> {
        let mut fds = libc::pollfd {
            fd: self.0.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = wait.as_millis().min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(rc > 0 && fds.revents & (libc::POLLIN | libc::POLLHUP) != 0)
    }
}

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

/// Configuration for one [`communicate`] run.
#[derive(Debug, Clone, Default)]
pub struct BridgeOptions {
    /// Abort once this long passes without a transfer in either direction.
    /// `None` disables the check.
    pub idle_timeout: Option<Duration>,
    /// Abort once this long passes since the loop started.
    pub absolute_timeout: Option<Duration>,
    /// Enter paste mode before streaming.
    pub paste_mode: bool,
    /// Return [`Outcome::RerunRequested`] when this path's mtime changes.
    pub watch: Option<PathBuf>,
    /// Read the entire input up front and stream write-only; for regular
    /// files with a definite end.
    pub no_select: bool,
}

/// How a [`communicate`] run ended (timeouts are errors, not outcomes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Input exhausted, exit byte delivered, device gone quiet.
    Completed,
    /// The watched file changed; the caller should reset and re-run.
    RerunRequested,
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

/// Relay bytes between `input`/`output` and the device session.
///
/// Returns [`Outcome::Completed`] only when input is exhausted, the
/// paste-exit byte has been sent, no watch is configured, and the device
/// has produced nothing for a full idle window.  With an idle timeout and
/// input still open, the same window elapsing is an [`SyncError::IdleTimeout`].
pub fn communicate<W, I, O>(
    session: &mut ReplSession<W>,
    input: &mut I,
    output: &mut O,
    opts: &BridgeOptions,
) -> SyncResult<Outcome>
where
    W: Wire,
    I: BridgeInput + ?Sized,
    O: Write + ?Sized,
{
    if opts.paste_mode {
        session.enter_paste_mode()?;
    }

    let baseline = match &opts.watch {
        Some(path) => Some(modified_time(path)?),
        None => None,
    };

    let mut upfront: Option<Bytes> = if opts.no_select {
        let mut whole = Vec::new();
        input.read_to_end(&mut whole)?;
        Some(Bytes::from(whole))
    } else {
        None
    };

    let started = Instant::now();
    let mut last_transfer = Instant::now();
    let mut input_done = false;
    let mut eof_mark_sent = false;
    let mut buf = [0u8; 256];

    loop {
        let mut transferred = false;

        // Local input → device.
        if !input_done {
            match &mut upfront {
                Some(data) => {
                    if data.is_empty() {
                        input_done = true;
                    } else {
                        let n = data.len().min(buf.len());
                        session.channel_mut().send(&data[..n])?;
                        data.advance(n);
                        session.mark_paste_active();
                        transferred = true;
                    }
                }
                None => {
                    if input.poll_ready(INPUT_POLL)? {
                        let n = input.read(&mut buf)?;
                        if n == 0 {
                            input_done = true;
                        } else {
                            session.channel_mut().send(&buf[..n])?;
                            session.mark_paste_active();
                            transferred = true;
                        }
                    }
                }
            }
        }

        // End of input: deliver the paste-exit byte exactly once.
        if input_done && !eof_mark_sent {
            if matches!(session.mode(), Mode::PasteEntering | Mode::PasteActive) {
                session.exit_paste_mode()?;
            } else {
                session.channel_mut().send(&[CTRL_EXIT_PASTE])?;
            }
            eof_mark_sent = true;
            transferred = true;
        }

        // Device output → local sink.
        loop {
            let n = session.channel_mut().read_available(&mut buf)?;
            if n == 0 {
                break;
            }
            output.write_all(&buf[..n])?;
            transferred = true;
        }
        output.flush()?;

        if transferred {
            last_transfer = Instant::now();
        }

        // Timeouts.
        if let Some(idle) = opts.idle_timeout {
            if last_transfer.elapsed() > idle {
                if input_done && eof_mark_sent && opts.watch.is_none() {
                    return Ok(Outcome::Completed);
                }
                return Err(SyncError::IdleTimeout);
            }
        }
        if let Some(total) = opts.absolute_timeout {
            if started.elapsed() > total {
                return Err(SyncError::AbsoluteTimeout);
            }
        }

        // Watch probe.
        if let Some(path) = &opts.watch {
            if modified_time(path)? != baseline.expect("baseline captured with watch") {
                log::info!("{} changed, rerun requested", path.display());
                return Ok(Outcome::RerunRequested);
            }
        }
    }
}

fn modified_time(path: &Path) -> SyncResult<SystemTime> {
    Ok(fs::metadata(path)?.modified()?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
