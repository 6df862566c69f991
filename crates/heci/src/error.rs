//! Error types for the session engine.
//!
//! Failures are split by how they reach the caller:
//!
//! - [`SessionError`] is returned synchronously for precondition violations
//!   detected before any native I/O is attempted.
//! - [`ConnectError`] is delivered through [`SessionEvents::on_error`] once an
//!   asynchronous connect handshake fails.
//! - [`IoFailure`] describes a failed read, write or control operation. It is
//!   passed to control callbacks and kept on the session as its last error.
//!
//! [`SessionEvents::on_error`]: crate::session::SessionEvents::on_error

use std::fmt;

use thiserror::Error;

/// Raw platform error code (`GetLastError()` on Windows, `errno` elsewhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsError(pub i32);

impl OsError {
    /// Captures the calling thread's last platform error.
    pub fn last() -> Self {
        Self(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Returns the raw code.
    pub fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "os error {}", self.0)
    }
}

impl From<std::io::Error> for OsError {
    fn from(err: std::io::Error) -> Self {
        // Errors synthesized without an OS code (e.g. short buffers) map to -1.
        Self(err.raw_os_error().unwrap_or(-1))
    }
}

impl From<OsError> for std::io::Error {
    fn from(err: OsError) -> Self {
        std::io::Error::from_raw_os_error(err.0)
    }
}

/// The native operation an [`IoFailure`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Control,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Control => "control",
        };
        f.write_str(name)
    }
}

/// Failure of a single asynchronous operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoFailure {
    /// The demultiplexer reported an abnormal wait status.
    #[error("wait failed: {0}")]
    Wait(String),

    /// The operation completed but its result could not be retrieved.
    #[error("overlapped error: {0}")]
    Overlapped(OsError),

    /// The operation was rejected when it was started.
    #[error("failed to start {op}: {error}")]
    Start {
        /// Which channel the operation belonged to.
        op: Operation,
        /// Platform error reported by the start call.
        error: OsError,
    },

    /// The device or one of its wait-events could not be acquired.
    #[error("device unavailable: {0}")]
    Device(String),
}

/// Asynchronous connect handshake failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The connect control request itself failed.
    #[error("HECI connection error [{0}]")]
    Rejected(IoFailure),

    /// The response was too short to carry the maximum message size.
    #[error("HECI connection error [INVALID RESPONSE: {len} bytes]")]
    InvalidResponse {
        /// Number of response bytes received.
        len: usize,
    },

    /// Wait-events for the data channels could not be created.
    #[error("HECI connection error [{0}]")]
    Resources(IoFailure),
}

/// Synchronous precondition failures reported by session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The operation requires an established connection.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while a connection exists or is being negotiated.
    #[error("session is already connected or connecting")]
    AlreadyConnected,

    /// The session has been torn down and is permanently inert.
    #[error("session is closed")]
    Closed,

    /// A chunk exceeds the negotiated maximum message size.
    #[error("buffer too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Size of the rejected chunk.
        size: usize,
        /// Negotiated maximum message size.
        max: usize,
    },

    /// The write channel failed earlier and no longer accepts chunks.
    #[error("write channel failed: {0}")]
    WriteFailed(IoFailure),
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
