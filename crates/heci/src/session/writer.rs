//! Write queue.
//!
//! Chunks are transferred in submission order, one at a time. In
//! [`WriteMode::Pipelined`] the next chunk starts as soon as the previous one
//! completes. In [`WriteMode::ReadGated`] a completed chunk stays at the front
//! of the queue until the read pipeline delivers an inbound message, which
//! enforces request/response turn-taking with the firmware.

use std::collections::VecDeque;

use super::{Session, SessionEvents, SessionState, WriteMode};
use crate::demux::{CompletionDemux, SignalStatus};
use crate::error::{IoFailure, Operation, Result, SessionError};
use crate::fault;
use crate::gateway::{DeviceIo, StartStatus};

/// Returned by [`Session::write`]: the producer should hold further writes
/// until the chunk's flush callback runs.
#[must_use = "the producer must wait for the flush callback before writing again"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitForFlush;

type FlushCallback = Box<dyn FnOnce()>;

/// Per-write outcome: `Ok` once the write is retired, the channel's failure
/// if it stalls first.
type RetireCallback = Box<dyn FnOnce(std::result::Result<(), IoFailure>)>;

struct PendingWrite {
    /// Moved into the gateway when the transfer starts.
    data: Option<Vec<u8>>,
    len: usize,
    on_flush: Option<FlushCallback>,
    on_retired: Option<RetireCallback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadState {
    Idle,
    InFlight,
    /// Read-gated only: transferred, waiting for an inbound message.
    AwaitingRelease,
    Stalled,
}

pub(super) struct WriteQueue {
    pending: VecDeque<PendingWrite>,
    head: HeadState,
    /// A read arrived while the head was still in flight.
    release_credit: bool,
    failure: Option<IoFailure>,
}

impl WriteQueue {
    pub(super) fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            head: HeadState::Idle,
            release_credit: false,
            failure: None,
        }
    }

    /// Drops every queued write without running its callbacks.
    pub(super) fn abandon(&mut self) {
        self.pending.clear();
        self.release_credit = false;
    }
}

impl<D: DeviceIo, M: CompletionDemux, E: SessionEvents> Session<D, M, E> {
    /// Queues `chunk` for transfer.
    ///
    /// `on_flush` runs when the queue drains after this chunk. The call always
    /// asks the producer to pause until then.
    ///
    /// # Errors
    /// Fails without touching the device if the session is not connected,
    /// the chunk exceeds the negotiated maximum message size, or the write
    /// channel has already failed.
    pub fn write<F>(&mut self, chunk: Vec<u8>, on_flush: F) -> Result<WaitForFlush>
    where
        F: FnOnce() + 'static,
    {
        self.enqueue_write(chunk, Some(Box::new(on_flush)), None)
    }

    /// Queues `chunk` and reports this write's own outcome.
    ///
    /// `on_retired` runs exactly once: with `Ok(())` when the chunk leaves the
    /// queue (after its transfer in pipelined mode, after the following read
    /// in read-gated mode), or with the channel's failure if the queue stalls
    /// before that. It is dropped uncalled when the session is torn down.
    /// Unlike [`write`](Self::write) it does not depend on the queue draining.
    ///
    /// # Errors
    /// Same as [`write`](Self::write).
    pub fn write_tracked<F>(&mut self, chunk: Vec<u8>, on_retired: F) -> Result<WaitForFlush>
    where
        F: FnOnce(std::result::Result<(), IoFailure>) + 'static,
    {
        self.enqueue_write(chunk, None, Some(Box::new(on_retired)))
    }

    fn enqueue_write(
        &mut self,
        chunk: Vec<u8>,
        on_flush: Option<FlushCallback>,
        on_retired: Option<RetireCallback>,
    ) -> Result<WaitForFlush> {
        match self.state {
            SessionState::Connected => {}
            SessionState::Closed => return Err(SessionError::Closed),
            _ => return Err(SessionError::NotConnected),
        }
        if self.write_event.is_none() {
            return Err(SessionError::NotConnected);
        }
        if let Some(failure) = &self.writer.failure {
            return Err(SessionError::WriteFailed(failure.clone()));
        }

        let max = self.max_message_size.unwrap_or(0) as usize;
        if chunk.len() > max {
            return Err(SessionError::MessageTooLarge {
                size: chunk.len(),
                max,
            });
        }

        let len = chunk.len();
        self.writer.pending.push_back(PendingWrite {
            data: Some(chunk),
            len,
            on_flush,
            on_retired,
        });
        tracing::debug!(bytes = len, pending = self.writer.pending.len(), "Queued write");

        if self.writer.pending.len() == 1 && self.writer.head == HeadState::Idle {
            self.start_write();
        }
        Ok(WaitForFlush)
    }

    /// Returns the number of queued writes, including the one in flight.
    pub fn pending_writes(&self) -> usize {
        self.writer.pending.len()
    }

    fn start_write(&mut self) {
        let (Some(device), Some(event)) = (self.device, self.write_event) else {
            return;
        };
        let Some(head) = self.writer.pending.front_mut() else {
            return;
        };
        let data = head.data.take().unwrap_or_default();
        let len = data.len();

        match self.io.start_write(device, event, data) {
            StartStatus::Pending | StartStatus::Completed => {
                self.writer.head = HeadState::InFlight;
                tracing::trace!(bytes = len, "Write started");
            }
            StartStatus::Failed(error) => {
                self.fail_writes(IoFailure::Start {
                    op: Operation::Write,
                    error,
                });
            }
        }
    }

    fn fail_writes(&mut self, failure: IoFailure) {
        tracing::error!(pending = self.writer.pending.len(), "Write failed: {}", failure);
        self.last_error = Some(failure.clone());
        self.writer.failure = Some(failure.clone());
        self.writer.head = HeadState::Stalled;

        let waiting: Vec<RetireCallback> = self
            .writer
            .pending
            .iter_mut()
            .filter_map(|w| w.on_retired.take())
            .collect();
        for on_retired in waiting {
            let failure = failure.clone();
            fault::guard("write callback", move || on_retired(Err(failure)));
        }
    }

    pub(super) fn on_write_signal(&mut self, status: SignalStatus) {
        if self.writer.head != HeadState::InFlight {
            tracing::trace!(head = ?self.writer.head, "Write signal with nothing in flight, ignoring");
            return;
        }

        if !status.is_ready() {
            self.fail_writes(IoFailure::Wait(status.to_string()));
            return;
        }

        let (Some(device), Some(event)) = (self.device, self.write_event) else {
            return;
        };
        let completion = self.io.completion(device, event);
        let written = match completion.result {
            Ok(n) => n as usize,
            Err(error) => {
                self.fail_writes(IoFailure::Overlapped(error));
                return;
            }
        };

        let expected = self.writer.pending.front().map(|w| w.len).unwrap_or(0);
        if written < expected {
            tracing::warn!(written, expected, "Short write");
        } else {
            tracing::debug!(bytes = written, "Write completed");
        }

        match self.options.write_mode {
            WriteMode::Pipelined => self.release_head(),
            WriteMode::ReadGated => {
                if std::mem::take(&mut self.writer.release_credit) {
                    self.release_head();
                } else {
                    self.writer.head = HeadState::AwaitingRelease;
                    tracing::trace!(
                        pending = self.writer.pending.len(),
                        "Write completed, held until next read"
                    );
                }
            }
        }
    }

    /// Called by the read pipeline after each delivery in read-gated mode.
    pub(super) fn release_gated_write(&mut self) {
        if self.writer.pending.is_empty() {
            return;
        }
        match self.writer.head {
            HeadState::AwaitingRelease => self.release_head(),
            HeadState::InFlight => {
                // The response overtook the write completion; release on completion.
                self.writer.release_credit = true;
            }
            HeadState::Idle | HeadState::Stalled => {}
        }
    }

    /// Retires the front write and starts the next, or flushes when drained.
    fn release_head(&mut self) {
        self.writer.head = HeadState::Idle;
        let Some(mut done) = self.writer.pending.pop_front() else {
            return;
        };
        if let Some(on_retired) = done.on_retired.take() {
            fault::guard("write callback", move || on_retired(Ok(())));
        }

        if !self.writer.pending.is_empty() {
            self.start_write();
        } else if let Some(flush) = done.on_flush {
            tracing::trace!("Write queue drained, flushing");
            fault::guard("flush callback", flush);
        }
    }
}
