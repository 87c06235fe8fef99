//! Serial transport: raw wire I/O and the buffered channel above it.
//!
//! Two layers:
//!
//! - [`Wire`] is the seam for raw duplex byte I/O plus the reset control
//!   line.  [`SerialWire`] implements it over a real serial port; the test
//!   suite substitutes a scripted mock.
//! - [`Channel`] owns the carry-over receive buffer and the *logical*
//!   wall-clock timeout.  `receive_until` appends newly arrived bytes and
//!   re-scans for the terminator, returning the bytes before the match and
//!   retaining whatever followed it for the next call.
//!
//! The wire's own read timeout is a short fixed poll interval so control
//! returns to the cooperative loop regularly; deadlines are enforced here,
//! not by the driver.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::errors::{SyncError, SyncResult};

/// Line separator used by the device prompt.
pub const EOL: &[u8] = b"\r\n";

/// Response terminator in normal prompt mode.
pub const PROMPT: &[u8] = b"\r\n>>> ";

/// Bare prompt marker awaited after a reset (the boot banner precedes it).
pub const PROMPT_BARE: &[u8] = b">>> ";

/// How long a single wire read may block before handing control back.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Hold time for the reset line pulse.
const RESET_PULSE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Wire trait
// ---------------------------------------------------------------------------

/// Raw duplex byte transport.
///
/// Implementations must make `read_some` return within roughly
/// [`POLL_INTERVAL`] even when no data arrives (returning `Ok(0)`), so that
/// callers can enforce their own deadlines and poll other sources.
pub trait Wire {
    /// Read whatever is available, blocking at most one poll interval.
    /// `Ok(0)` means nothing arrived.
    fn read_some(&mut self, buf: &mut [u8]) -> SyncResult<usize>;

    /// Write a prefix of `data`, returning how many bytes were accepted.
    fn write_some(&mut self, data: &[u8]) -> SyncResult<usize>;

    /// Bytes already buffered by the driver, readable without blocking.
    fn bytes_ready(&mut self) -> SyncResult<usize>;

    /// Drive the reset control line through its low/high pulse, rebooting
    /// the device into the prompt.
    fn pulse_reset(&mut self) -> SyncResult<()>;
}

// ---------------------------------------------------------------------------
// SerialWire
// ---------------------------------------------------------------------------

/// [`Wire`] over a real serial port.
pub struct SerialWire {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialWire {
    /// Open and exclusively acquire `port_name` at `baud`.  Failure to
    /// acquire the port is a configuration error naming the port.
    pub fn open(port_name: &str, baud: u32) -> SyncResult<Self> {
        let port = serialport::new(port_name, baud)
            .timeout(POLL_INTERVAL)
            .open()
            .map_err(|e| SyncError::Config {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { port })
    }
}

impl Wire for SerialWire {
    fn read_some(&mut self, buf: &mut [u8]) -> SyncResult<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_some(&mut self, data: &[u8]) -> SyncResult<usize> {
        Ok(self.port.write(data)?)
    }

    fn bytes_ready(&mut self) -> SyncResult<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))
    }

    fn pulse_reset(&mut self) -> SyncResult<()> {
        // RTS is wired to the reset pin, active low.
        self.port
            .write_request_to_send(false)
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;
        std::thread::sleep(RESET_PULSE);
        self.port
            .write_request_to_send(true)
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Buffered, deadline-enforcing channel over a [`Wire`].
///
/// Opened once per invocation; dropping it releases the port on every exit
/// path.
pub struct Channel<W: Wire> {
    wire: W,
    pending: Vec<u8>,
    timeout: Option<Duration>,
}

impl<W: Wire> Channel<W> {
    /// `timeout` bounds every `receive_until` call; `None` waits forever.
    pub fn new(wire: W, timeout: Option<Duration>) -> Self {
        Self {
            wire,
            pending: Vec::new(),
            timeout,
        }
    }

    /// Write the whole buffer, looping over partial writes.
    pub fn send(&mut self, data: &[u8]) -> SyncResult<()> {
        let mut idx = 0;
        while idx < data.len() {
            idx += self.wire.write_some(&data[idx..])?;
        }
        Ok(())
    }

    /// Receive until `terminator` appears as a contiguous substring.
    /// Returns the bytes preceding it; bytes after it are retained for the
    /// next call.  Fails with `TransportTimeout` once wall-clock time since
    /// the call began exceeds the configured timeout.
    pub fn receive_until(&mut self, terminator: &[u8]) -> SyncResult<Vec<u8>> {
        let started = Instant::now();
        let mut buf = [0u8; 256];
        loop {
            if let Some(idx) = find_subsequence(&self.pending, terminator) {
                let tail = self.pending.split_off(idx + terminator.len());
                self.pending.truncate(idx);
                return Ok(std::mem::replace(&mut self.pending, tail));
            }
            let n = self.wire.read_some(&mut buf)?;
            self.pending.extend_from_slice(&buf[..n]);
            if let Some(limit) = self.timeout {
                if started.elapsed() > limit {
                    return Err(SyncError::TransportTimeout);
                }
            }
        }
    }

    /// Pulse the reset line, discard stale bytes, and block until the
    /// prompt reappears after the boot banner.
    pub fn reset(&mut self) -> SyncResult<()> {
        self.wire.pulse_reset()?;
        self.pending.clear();
        self.receive_until(PROMPT_BARE)?;
        Ok(())
    }

    /// Read whatever is immediately available: carry-over bytes first,
    /// otherwise one wire read (blocking at most a poll interval).
    pub fn read_available(&mut self, buf: &mut [u8]) -> SyncResult<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        self.wire.read_some(buf)
    }

    /// Bytes readable without blocking (carry-over plus driver buffer).
    pub fn bytes_ready(&mut self) -> SyncResult<usize> {
        Ok(self.pending.len() + self.wire.bytes_ready()?)
    }

    #[cfg(test)]
    pub fn wire(&self) -> &W {
        &self.wire
    }
}

/// First index of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ---------------------------------------------------------------------------
// Scripted wire for tests
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
