//! Control dispatcher.
//!
//! Serializes device-control requests so that at most one is outstanding.
//! Requests enter at the back of the queue; the front is the one in flight,
//! and the next one is started from the completion of the previous.

use std::collections::VecDeque;

use super::{Session, SessionEvents, SessionState};
use crate::demux::{CompletionDemux, SignalStatus};
use crate::error::{IoFailure, Operation, Result, SessionError};
use crate::fault;
use crate::gateway::{DeviceIo, StartStatus};

/// Result handed to a control callback: the response bytes, or the failure.
pub type ControlOutcome = std::result::Result<Vec<u8>, IoFailure>;

/// Completion callback of a control request.
pub type ControlCallback<D, M, E> = Box<dyn FnOnce(&mut Session<D, M, E>, ControlOutcome)>;

struct ControlRequest<D: DeviceIo, M: CompletionDemux, E: SessionEvents> {
    code: u32,
    input: Vec<u8>,
    output_capacity: usize,
    callback: ControlCallback<D, M, E>,
}

pub(super) struct ControlQueue<D: DeviceIo, M: CompletionDemux, E: SessionEvents> {
    pending: VecDeque<ControlRequest<D, M, E>>,
    in_flight: bool,
}

impl<D: DeviceIo, M: CompletionDemux, E: SessionEvents> ControlQueue<D, M, E> {
    pub(super) fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: false,
        }
    }

    pub(super) fn abandon(&mut self) {
        self.pending.clear();
        self.in_flight = false;
    }
}

impl<D: DeviceIo, M: CompletionDemux, E: SessionEvents> Session<D, M, E> {
    /// Queues a device-control request.
    ///
    /// `callback` runs exactly once, after the request completes, with the
    /// response truncated to the number of bytes the device returned. Requests
    /// complete in submission order. I/O failures are reported through the
    /// callback, never returned here.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] once the session has been torn down.
    pub fn send_control<F>(
        &mut self,
        code: u32,
        input: Vec<u8>,
        output_capacity: usize,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Self, ControlOutcome) + 'static,
    {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }

        self.control.pending.push_back(ControlRequest {
            code,
            input,
            output_capacity,
            callback: Box::new(callback),
        });
        tracing::debug!(
            code = format_args!("{:#010x}", code),
            pending = self.control.pending.len(),
            "Queued control request"
        );

        if !self.control.in_flight {
            self.dispatch_control();
        }
        Ok(())
    }

    /// Returns the number of control requests queued, including the one in flight.
    pub fn pending_controls(&self) -> usize {
        self.control.pending.len()
    }

    /// Starts the request at the front of the queue.
    ///
    /// Requests that cannot be started are failed in order until one starts or
    /// the queue is empty.
    fn dispatch_control(&mut self) {
        while !self.control.in_flight && self.state != SessionState::Closed {
            let Some(head) = self.control.pending.front_mut() else {
                break;
            };
            let code = head.code;
            let input = std::mem::take(&mut head.input);
            let output = vec![0u8; head.output_capacity];

            let (device, event) = match self.ensure_device() {
                Ok(handles) => handles,
                Err(failure) => {
                    self.fail_control_head(failure);
                    continue;
                }
            };

            match self.io.start_control(device, event, code, input, output) {
                StartStatus::Pending | StartStatus::Completed => {
                    self.control.in_flight = true;
                    tracing::trace!(code = format_args!("{:#010x}", code), "Control request started");
                }
                StartStatus::Failed(error) => {
                    self.fail_control_head(IoFailure::Start {
                        op: Operation::Control,
                        error,
                    });
                }
            }
        }
    }

    fn fail_control_head(&mut self, failure: IoFailure) {
        let Some(request) = self.control.pending.pop_front() else {
            return;
        };
        tracing::warn!(
            code = format_args!("{:#010x}", request.code),
            "Control request failed: {}",
            failure
        );
        self.last_error = Some(failure.clone());
        self.invoke_control_callback(request.callback, Err(failure));
    }

    fn invoke_control_callback(&mut self, callback: ControlCallback<D, M, E>, outcome: ControlOutcome) {
        fault::guard("control callback", || callback(self, outcome));
    }

    pub(super) fn on_control_signal(&mut self, status: SignalStatus) {
        if !self.control.in_flight {
            tracing::trace!("Control signal with nothing in flight, ignoring");
            return;
        }
        self.control.in_flight = false;

        let Some(request) = self.control.pending.pop_front() else {
            return;
        };

        let outcome = if status.is_ready() {
            self.control_result()
        } else {
            Err(IoFailure::Wait(status.to_string()))
        };

        match &outcome {
            Ok(output) => {
                self.last_error = None;
                tracing::debug!(
                    code = format_args!("{:#010x}", request.code),
                    bytes = output.len(),
                    "Control request completed"
                );
            }
            Err(failure) => {
                self.last_error = Some(failure.clone());
                tracing::warn!(
                    code = format_args!("{:#010x}", request.code),
                    "Control request failed: {}",
                    failure
                );
            }
        }

        self.invoke_control_callback(request.callback, outcome);

        if !self.control.pending.is_empty() {
            self.dispatch_control();
        }
    }

    fn control_result(&mut self) -> ControlOutcome {
        let (Some(device), Some(event)) = (self.device, self.control_event) else {
            return Err(IoFailure::Device("handle closed".to_string()));
        };

        let completion = self.io.completion(device, event);
        match completion.result {
            Ok(transferred) => {
                let mut output = completion.buffer;
                output.truncate(transferred as usize);
                Ok(output)
            }
            Err(error) => Err(IoFailure::Overlapped(error)),
        }
    }
}
