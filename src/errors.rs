//! Error taxonomy for the sync engine.
//!
//! One enum covers every layer: transport timeouts, protocol
//! desynchronization, classified device-side faults, literal decode
//! failures, local filesystem collisions, and the bridge's two timeout
//! flavors.  Only `stat` ever absorbs a fault (the device's `ENOENT`
//! subtype); everything else propagates and aborts the current operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("serial: could not open port {port}: {reason}")]
    Config { port: String, reason: String },

    #[error("transport: timed out waiting for response terminator")]
    TransportTimeout,

    /// The device echoed something other than what we sent.  The session
    /// is desynchronized and must not be reused.
    #[error("protocol: echo mismatch, session is desynchronized")]
    ProtocolEcho,

    /// The device printed a traceback.  The full text is kept; display
    /// shows only the final line, which carries the exception.
    #[error("remote: {}", last_line(.0))]
    RemoteFault(String),

    #[error("remote: no such file or directory: {0}")]
    NotFound(String),

    /// A primitive's reply did not have the expected shape (missing
    /// success sentinel, wrong literal type, impossible write count).
    #[error("protocol: unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("decode: {0}")]
    BadLiteral(String),

    /// An out-of-order prompt mode transition was requested.
    #[error("session: {0}")]
    SessionState(String),

    #[error("path: remote path must be absolute: {0}")]
    RelativePath(String),

    #[error("transfer: destination {0} already exists")]
    DestinationExists(String),

    #[error("transfer: cannot overwrite a directory with a file: {src} -> {dst}")]
    FileOverDirectory { src: String, dst: String },

    #[error("transfer: cannot overwrite a file with a directory: {src} -> {dst}")]
    DirectoryOverFile { src: String, dst: String },

    #[error("transfer: {0} is not an existing directory")]
    NotADirectory(String),

    #[error("transfer: source is not a regular file or directory: {0}")]
    BadSource(String),

    #[error("{0} exists and is not a directory")]
    PrefixNotDirectory(String),

    #[error("bridge: no data transferred within the idle timeout")]
    IdleTimeout,

    #[error("bridge: total session timeout elapsed")]
    AbsoluteTimeout,

    #[error("local: {0}")]
    Io(#[from] std::io::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Final line of a (possibly multi-line) fault text.
pub fn last_line(text: &str) -> &str {
    text.lines().last().unwrap_or("")
}

impl SyncError {
    /// True for the device's "no such entry" fault: the traceback's final
    /// line names `ENOENT`.  `stat` downgrades exactly this case to an
    /// absent result.
    pub fn is_not_found_fault(&self) -> bool {
        match self {
            SyncError::RemoteFault(text) => last_line(text).trim_end().ends_with("ENOENT"),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
