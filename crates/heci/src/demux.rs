//! Completion demultiplexer interface.
//!
//! A demultiplexer watches registered wait-events and reports each firing as
//! a [`Signal`]. Backends push signals into a channel; whoever owns the
//! session feeds them to [`Session::on_signal`](crate::Session::on_signal)
//! one at a time, which keeps every callback on a single thread of control.

use std::fmt;

use crate::error::OsError;
use crate::gateway::WaitEvent;

/// Status carried by a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalStatus {
    /// The event fired with no error pending.
    Ready,
    /// Waiting on the event failed.
    Failed(String),
    /// The wait was abandoned (event closed or watcher torn down).
    Abandoned,
}

impl SignalStatus {
    /// Whether the signal reports a normal completion.
    pub fn is_ready(&self) -> bool {
        matches!(self, SignalStatus::Ready)
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalStatus::Ready => f.write_str("NONE"),
            SignalStatus::Failed(reason) => write!(f, "FAILED: {}", reason),
            SignalStatus::Abandoned => f.write_str("ABANDONED"),
        }
    }
}

/// A wait-event firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// The event that fired.
    pub event: WaitEvent,
    /// How it fired.
    pub status: SignalStatus,
}

impl Signal {
    /// A normal completion for `event`.
    pub fn ready(event: WaitEvent) -> Self {
        Self {
            event,
            status: SignalStatus::Ready,
        }
    }

    /// An abnormal completion for `event`.
    pub fn failed(event: WaitEvent, reason: impl Into<String>) -> Self {
        Self {
            event,
            status: SignalStatus::Failed(reason.into()),
        }
    }
}

/// Registration side of the platform's completion mechanism.
pub trait CompletionDemux {
    /// Starts watching `event`; `metadata` names it in diagnostics.
    fn register(&mut self, event: WaitEvent, metadata: &'static str) -> Result<(), OsError>;

    /// Stops watching `event`. Signals already queued for it may still arrive.
    fn deregister(&mut self, event: WaitEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(SignalStatus::Ready.to_string(), "NONE");
        assert_eq!(
            SignalStatus::Failed("timeout".to_string()).to_string(),
            "FAILED: timeout"
        );
        assert_eq!(SignalStatus::Abandoned.to_string(), "ABANDONED");
    }

    #[test]
    fn test_signal_constructors() {
        let ready = Signal::ready(WaitEvent(7));
        assert!(ready.status.is_ready());

        let failed = Signal::failed(WaitEvent(7), "boom");
        assert!(!failed.status.is_ready());
        assert_eq!(failed.event, WaitEvent(7));
    }
}
