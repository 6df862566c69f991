//! Read pipeline.
//!
//! Keeps exactly one read outstanding while the consumer asks for data. The
//! read buffer is sized to the negotiated maximum message size and reused for
//! every read; consumers only ever see a borrowed slice of it.

use super::{Demand, Session, SessionEvents, SessionState, WriteMode};
use crate::demux::{CompletionDemux, SignalStatus};
use crate::error::{IoFailure, Operation};
use crate::fault;
use crate::gateway::{DeviceIo, StartStatus};

/// State of the read pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// No read outstanding; waiting for the consumer to pull.
    Idle,
    /// A read is outstanding.
    Pending,
    /// The stream has ended. No further reads are issued.
    Closed,
}

pub(super) struct ReadPipeline {
    state: ReadState,
    buffer: Option<Vec<u8>>,
}

impl ReadPipeline {
    pub(super) fn new() -> Self {
        Self {
            state: ReadState::Idle,
            buffer: None,
        }
    }

    pub(super) fn close(&mut self) {
        self.state = ReadState::Closed;
        self.buffer = None;
    }
}

impl<D: DeviceIo, M: CompletionDemux, E: SessionEvents> Session<D, M, E> {
    /// Returns the read pipeline state.
    pub fn read_state(&self) -> ReadState {
        self.reader.state
    }

    /// Signals that the consumer wants more data.
    ///
    /// Issues a read unless one is already outstanding, the stream has ended,
    /// or the session is not connected.
    pub fn pull(&mut self) {
        if self.state != SessionState::Connected || self.reader.state != ReadState::Idle {
            tracing::trace!(state = ?self.reader.state, "Pull ignored");
            return;
        }
        self.start_read();
    }

    pub(super) fn start_read(&mut self) {
        let (Some(device), Some(event), Some(max)) =
            (self.device, self.read_event, self.max_message_size)
        else {
            return;
        };
        if self.reader.state != ReadState::Idle {
            return;
        }

        let size = max as usize;
        let buffer = self
            .reader
            .buffer
            .take()
            .filter(|b| b.len() == size)
            .unwrap_or_else(|| vec![0u8; size]);

        match self.io.start_read(device, event, buffer) {
            StartStatus::Pending | StartStatus::Completed => {
                self.reader.state = ReadState::Pending;
                tracing::trace!(size, "Read started");
            }
            StartStatus::Failed(error) => {
                let failure = IoFailure::Start {
                    op: Operation::Read,
                    error,
                };
                tracing::error!("Read could not be started: {}", failure);
                self.last_error = Some(failure);
                self.end_stream();
            }
        }
    }

    pub(super) fn on_read_signal(&mut self, status: SignalStatus) {
        if self.reader.state != ReadState::Pending {
            tracing::trace!(state = ?self.reader.state, "Read signal with nothing pending, ignoring");
            return;
        }

        if !status.is_ready() {
            tracing::error!(status = %status, "Read failed, ending stream");
            self.last_error = Some(IoFailure::Wait(status.to_string()));
            self.end_stream();
            return;
        }

        let (Some(device), Some(event)) = (self.device, self.read_event) else {
            self.end_stream();
            return;
        };

        let completion = self.io.completion(device, event);
        let transferred = match completion.result {
            Ok(n) => n as usize,
            Err(error) => {
                let failure = IoFailure::Overlapped(error);
                tracing::error!("Read result unavailable, ending stream: {}", failure);
                self.last_error = Some(failure);
                self.end_stream();
                return;
            }
        };

        let buffer = completion.buffer;
        let len = transferred.min(buffer.len());
        tracing::debug!(bytes = len, "Read completed");

        let events = &mut self.events;
        let demand = fault::guard("on_data", || events.on_data(&buffer[..len])).unwrap_or(Demand::Pause);

        self.reader.buffer = Some(buffer);
        self.reader.state = ReadState::Idle;

        if self.options.write_mode == WriteMode::ReadGated {
            self.release_gated_write();
        }

        if demand == Demand::More && self.state == SessionState::Connected {
            self.start_read();
        }
    }

    fn end_stream(&mut self) {
        if self.reader.state == ReadState::Closed {
            return;
        }
        self.reader.close();
        tracing::debug!("Read stream ended");
        let events = &mut self.events;
        fault::guard("on_end", || events.on_end());
    }
}
