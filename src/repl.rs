//! Line-oriented execution against the device prompt.
//!
//! [`ReplSession`] turns the echoing, traceback-printing interactive prompt
//! into something callable: send one line, strip the echo, classify the
//! reply.  On top of that, [`ReplSession::evaluate`] runs an expression and
//! decodes the printed literal that comes back.
//!
//! The session also owns the prompt mode tag.  Mode switches are single
//! control bytes; entering raw mode additionally waits for its banner.
//! Transitions are checked against the tag so an out-of-order switch is an
//! error instead of a silently confused device.

#![allow(dead_code)]

use crate::errors::{SyncError, SyncResult};
use crate::literal::{self, Literal};
use crate::transport::{Channel, EOL, PROMPT, Wire};

/// First line of every device traceback.
pub const TRACEBACK_MARKER: &str = "Traceback (most recent call last):";

/// Ctrl-A: enter raw mode.
pub const CTRL_ENTER_RAW: u8 = 0x01;
/// Ctrl-E: enter paste mode.
pub const CTRL_ENTER_PASTE: u8 = 0x05;
/// Ctrl-D: leave paste mode and run the pasted input.
pub const CTRL_EXIT_PASTE: u8 = 0x04;

/// Banner substring printed by the device when raw mode is entered.
pub const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit";

/// Prompt mode, as a single tag so illegal combinations cannot exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    RawEntering,
    PasteEntering,
    PasteActive,
}

// ---------------------------------------------------------------------------
// ReplSession
// ---------------------------------------------------------------------------

/// One interactive session over an open channel.  Lives exactly as long as
/// the channel; holds the once-per-session setup flag and the mode tag.
pub struct ReplSession<W: Wire> {
    chan: Channel<W>,
    os_imported: bool,
    mode: Mode,
}

impl<W: Wire> ReplSession<W> {
    pub fn new(chan: Channel<W>) -> Self {
        Self {
            chan,
            os_imported: false,
            mode: Mode::Normal,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn channel_mut(&mut self) -> &mut Channel<W> {
        &mut self.chan
    }

    /// Reboot the device into a fresh prompt and forget session state that
    /// the reboot invalidated.
    pub fn reset_device(&mut self) -> SyncResult<()> {
        self.chan.reset()?;
        self.os_imported = false;
        self.mode = Mode::Normal;
        Ok(())
    }

    /// Execute one line and return the response text (echo stripped,
    /// prompt terminator consumed).
    pub fn execute(&mut self, line: &str) -> SyncResult<String> {
        self.execute_with(line, PROMPT, true)
    }

    /// Execute one line with an explicit terminator and echo policy.
    ///
    /// With `expect_echo`, the response must begin with exactly the bytes
    /// sent; a mismatch means the session is no longer trustworthy and
    /// fails with `ProtocolEcho` — abort, don't retry.
    pub fn execute_with(
        &mut self,
        line: &str,
        terminator: &[u8],
        expect_echo: bool,
    ) -> SyncResult<String> {
        let mut cmd = line.as_bytes().to_vec();
        if !cmd.ends_with(EOL) {
            cmd.extend_from_slice(EOL);
        }
        self.chan.send(&cmd)?;
        let mut reply = self.chan.receive_until(terminator)?;
        if expect_echo {
            if !reply.starts_with(&cmd) {
                log::debug!(
                    "echo mismatch: sent {:?}, got {:?}",
                    String::from_utf8_lossy(&cmd),
                    String::from_utf8_lossy(&reply[..reply.len().min(cmd.len())])
                );
                return Err(SyncError::ProtocolEcho);
            }
            reply.drain(..cmd.len());
        }
        let text = String::from_utf8(reply)
            .map_err(|_| SyncError::UnexpectedReply("response is not valid text".into()))?;
        log::trace!("execute {line:?} -> {text:?}");
        if text.starts_with(TRACEBACK_MARKER) {
            return Err(SyncError::RemoteFault(text));
        }
        Ok(text)
    }

    /// Evaluate an expression and decode the literal the device prints.
    ///
    /// The first evaluation of a session imports the device's filesystem
    /// module; the flag is cached so the import runs once per session.
    pub fn evaluate(&mut self, expr: &str) -> SyncResult<Literal> {
        if !self.os_imported {
            self.execute_with("import os", PROMPT, false)?;
            self.os_imported = true;
        }
        let text = self.execute(expr)?;
        literal::parse(text.trim())
    }

    // -----------------------------------------------------------------------
    // Mode control
    // -----------------------------------------------------------------------

    /// Enter raw mode and wait for its banner.
    pub fn enter_raw_mode(&mut self) -> SyncResult<()> {
        if self.mode != Mode::Normal {
            return Err(SyncError::SessionState(format!(
                "cannot enter raw mode from {:?}",
                self.mode
            )));
        }
        self.mode = Mode::RawEntering;
        self.chan.send(&[CTRL_ENTER_RAW])?;
        self.chan.receive_until(RAW_BANNER)?;
        Ok(())
    }

    /// Enter paste mode.  The device's paste banner is not awaited; it
    /// flows through to whoever is draining output.
    pub fn enter_paste_mode(&mut self) -> SyncResult<()> {
        if self.mode != Mode::Normal {
            return Err(SyncError::SessionState(format!(
                "cannot enter paste mode from {:?}",
                self.mode
            )));
        }
        self.chan.send(&[CTRL_ENTER_PASTE])?;
        self.mode = Mode::PasteEntering;
        Ok(())
    }

    /// Record that pasted input has started flowing.
    pub fn mark_paste_active(&mut self) {
        if self.mode == Mode::PasteEntering {
            self.mode = Mode::PasteActive;
        }
    }

    /// Leave paste mode, handing the pasted input to the interpreter.
    pub fn exit_paste_mode(&mut self) -> SyncResult<()> {
        match self.mode {
            Mode::PasteEntering | Mode::PasteActive => {
                self.chan.send(&[CTRL_EXIT_PASTE])?;
                self.mode = Mode::Normal;
                Ok(())
            }
            other => Err(SyncError::SessionState(format!(
                "cannot exit paste mode from {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::testsupport::*;
    use super::*;
    use crate::transport::testwire::MockWire;

    // -- execute -------------------------------------------------------------

    #[test]
    fn execute_strips_echo_and_terminator() {
        let mut wire = MockWire::new();
        script_exchange(&mut wire, "1+1", "2");
        let mut sess = session(wire);
        assert_eq!(sess.execute("1+1").unwrap(), "2");
    }

    #[test]
    fn execute_appends_line_separator_once() {
        let mut wire = MockWire::new();
        script_exchange(&mut wire, "print(1)", "1");
        let mut sess = session(wire);
        sess.execute("print(1)\r\n").unwrap();
        assert_eq!(sess.channel_mut().bytes_ready().unwrap(), 0);
    }

    #[test]
    fn execute_echo_mismatch_is_fatal() {
        let mut wire = MockWire::new();
        wire.expect(b"ping\r\n", b"pong\r\nsomething\r\n>>> ");
        let mut sess = session(wire);
        assert!(matches!(
            sess.execute("ping"),
            Err(SyncError::ProtocolEcho)
        ));
    }

    #[test]
    fn execute_classifies_traceback() {
        let mut wire = MockWire::new();
        script_fault(
            &mut wire,
            "1/0",
            "Traceback (most recent call last):\r\nZeroDivisionError: divide by zero",
        );
        let mut sess = session(wire);
        match sess.execute("1/0") {
            Err(SyncError::RemoteFault(text)) => {
                assert!(text.starts_with(TRACEBACK_MARKER));
                assert!(text.ends_with("divide by zero"));
            }
            other => panic!("expected RemoteFault, got {other:?}"),
        }
    }

    // -- evaluate ------------------------------------------------------------

    #[test]
    fn evaluate_imports_os_once() {
        let mut wire = MockWire::new();
        script_import_os(&mut wire);
        script_exchange(&mut wire, "os.listdir('/')", "['boot.py']");
        script_exchange(&mut wire, "os.listdir('/lib')", "[]");
        let mut sess = session(wire);

        let first = sess.evaluate("os.listdir('/')").unwrap();
        assert_eq!(first.as_list().unwrap().len(), 1);

        // Second evaluation must not re-import.
        let second = sess.evaluate("os.listdir('/lib')").unwrap();
        assert_eq!(second.as_list().unwrap().len(), 0);
    }

    #[test]
    fn evaluate_decodes_integers() {
        let mut wire = MockWire::new();
        script_import_os(&mut wire);
        script_exchange(&mut wire, "_fout.write(b'abc')", "3");
        let mut sess = session(wire);
        assert_eq!(
            sess.evaluate("_fout.write(b'abc')").unwrap(),
            crate::literal::Literal::Int(3)
        );
    }

    // -- mode control --------------------------------------------------------

    #[test]
    fn raw_mode_sends_control_byte_and_waits_for_banner() {
        let mut wire = MockWire::new();
        wire.expect([CTRL_ENTER_RAW], b"\r\nraw REPL; CTRL-B to exit\r\n>");
        let mut sess = session(wire);
        sess.enter_raw_mode().unwrap();
        assert_eq!(sess.mode(), Mode::RawEntering);
    }

    #[test]
    fn paste_mode_round_trip() {
        let mut sess = session(MockWire::new());
        sess.enter_paste_mode().unwrap();
        assert_eq!(sess.mode(), Mode::PasteEntering);
        sess.mark_paste_active();
        assert_eq!(sess.mode(), Mode::PasteActive);
        sess.exit_paste_mode().unwrap();
        assert_eq!(sess.mode(), Mode::Normal);
        assert_eq!(
            sess.channel_mut().wire().tx,
            vec![CTRL_ENTER_PASTE, CTRL_EXIT_PASTE]
        );
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut sess = session(MockWire::new());
        assert!(matches!(
            sess.exit_paste_mode(),
            Err(SyncError::SessionState(_))
        ));
        sess.enter_paste_mode().unwrap();
        assert!(matches!(
            sess.enter_raw_mode(),
            Err(SyncError::SessionState(_))
        ));
        assert!(matches!(
            sess.enter_paste_mode(),
            Err(SyncError::SessionState(_))
        ));
    }

    #[test]
    fn reset_clears_session_state() {
        let mut wire = MockWire::new();
        script_import_os(&mut wire);
        script_exchange(&mut wire, "1", "1");
        wire.reset_reply = Some(b"\r\nbanner\r\n>>> ".to_vec());
        let mut sess = session(wire);
        sess.evaluate("1").unwrap();
        sess.reset_device().unwrap();
        assert_eq!(sess.mode(), Mode::Normal);
        assert_eq!(sess.channel_mut().wire().resets, 1);
    }
}
