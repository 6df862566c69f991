//! Device session.
//!
//! A [`Session`] owns one device handle and its per-direction wait-events and
//! multiplexes three channels over them:
//!
//! - the control dispatcher (`control`), one device-control request in flight
//! - the read pipeline (`reader`), one read in flight, paced by the consumer
//! - the write queue (`writer`), one write in flight, optionally paced by reads
//!
//! All work happens on the caller's thread. Completions arrive as [`Signal`]s
//! passed to [`Session::on_signal`]; nothing here blocks.

mod control;
mod events;
mod options;
mod reader;
mod writer;

pub use control::{ControlCallback, ControlOutcome};
pub use events::{Demand, SessionEvents};
pub use options::{ConnectOptions, WriteMode};
pub use reader::ReadState;
pub use writer::WaitForFlush;

use control::ControlQueue;
use reader::ReadPipeline;
use writer::WriteQueue;

use crate::demux::{CompletionDemux, Signal};
use crate::error::{ConnectError, IoFailure, Result, SessionError};
use crate::fault;
use crate::gateway::{DeviceHandle, DeviceIo, WaitEvent};
use crate::protocol::{self, ClientGuid};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, no connection negotiated yet.
    Disconnected,
    /// The connect control request is queued or in flight.
    Connecting,
    /// Handshake succeeded; data channels are live.
    Connected,
    /// Torn down. The session is permanently inert.
    Closed,
}

/// One connection to a firmware client over a handle-based device.
pub struct Session<D: DeviceIo, M: CompletionDemux, E: SessionEvents> {
    io: D,
    demux: M,
    events: E,
    device_path: String,

    device: Option<DeviceHandle>,
    control_event: Option<WaitEvent>,
    read_event: Option<WaitEvent>,
    write_event: Option<WaitEvent>,

    state: SessionState,
    max_message_size: Option<u32>,
    options: ConnectOptions,
    last_error: Option<IoFailure>,

    control: ControlQueue<D, M, E>,
    reader: ReadPipeline,
    writer: WriteQueue,
}

impl<D: DeviceIo, M: CompletionDemux, E: SessionEvents> Session<D, M, E> {
    /// Creates a disconnected session for the device at `device_path`.
    ///
    /// The device is opened lazily by the first control request.
    pub fn new(io: D, demux: M, device_path: impl Into<String>, events: E) -> Self {
        Self {
            io,
            demux,
            events,
            device_path: device_path.into(),
            device: None,
            control_event: None,
            read_event: None,
            write_event: None,
            state: SessionState::Disconnected,
            max_message_size: None,
            options: ConnectOptions::default(),
            last_error: None,
            control: ControlQueue::new(),
            reader: ReadPipeline::new(),
            writer: WriteQueue::new(),
        }
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns whether the handshake has completed and the session is live.
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Returns the negotiated maximum message size, once connected.
    pub fn max_message_size(&self) -> Option<u32> {
        self.max_message_size
    }

    /// Returns the most recent I/O failure, if any.
    pub fn last_error(&self) -> Option<&IoFailure> {
        self.last_error.as_ref()
    }

    /// Returns the write flow-control discipline in effect.
    pub fn write_mode(&self) -> WriteMode {
        self.options.write_mode
    }

    /// Returns the device path this session opens.
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Returns the notification sink.
    pub fn events(&self) -> &E {
        &self.events
    }

    /// Returns the notification sink mutably.
    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    /// Connects to the firmware client `client`.
    ///
    /// The outcome is reported asynchronously through
    /// [`SessionEvents::on_connected`] or [`SessionEvents::on_error`].
    pub fn connect(&mut self, client: ClientGuid, options: ConnectOptions) -> Result<()> {
        match self.state {
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Connecting | SessionState::Connected => {
                return Err(SessionError::AlreadyConnected)
            }
            SessionState::Disconnected => {}
        }

        tracing::info!(client = %client, device = %self.device_path, "Connecting to firmware client");
        self.state = SessionState::Connecting;
        self.send_control(
            protocol::CLIENT_CONNECT,
            client.to_wire().to_vec(),
            protocol::CONNECT_RESPONSE_CAPACITY,
            move |session, outcome| session.finish_connect(outcome, options),
        )
    }

    fn finish_connect(&mut self, outcome: ControlOutcome, options: ConnectOptions) {
        if self.state != SessionState::Connecting {
            tracing::debug!("Connect response arrived after teardown, ignoring");
            return;
        }

        let response = match outcome {
            Ok(response) => response,
            Err(failure) => {
                self.state = SessionState::Disconnected;
                self.notify_error(ConnectError::Rejected(failure));
                return;
            }
        };

        let Some(max) = protocol::max_message_size(&response) else {
            self.state = SessionState::Disconnected;
            self.notify_error(ConnectError::InvalidResponse {
                len: response.len(),
            });
            return;
        };

        if let Err(failure) = self.open_data_events() {
            self.state = SessionState::Disconnected;
            self.notify_error(ConnectError::Resources(failure));
            return;
        }

        self.max_message_size = Some(max);
        self.options = options;
        self.state = SessionState::Connected;
        tracing::info!(
            max_message_size = max,
            write_mode = ?options.write_mode,
            "Connected"
        );

        self.start_read();
        let events = &mut self.events;
        fault::guard("on_connected", || events.on_connected(max));
    }

    fn notify_error(&mut self, error: ConnectError) {
        tracing::error!("{}", error);
        let events = &mut self.events;
        fault::guard("on_error", || events.on_error(&error));
    }

    /// Opens the device and the control wait-event on first use.
    fn ensure_device(&mut self) -> std::result::Result<(DeviceHandle, WaitEvent), IoFailure> {
        let device = match self.device {
            Some(device) => device,
            None => {
                let device = self.io.open_device(&self.device_path).map_err(|e| {
                    IoFailure::Device(format!("failed to open {}: {}", self.device_path, e))
                })?;
                tracing::debug!(device = %self.device_path, "Opened device");
                self.device = Some(device);
                device
            }
        };

        let event = match self.control_event {
            Some(event) => event,
            None => {
                let event = self.create_watched_event("heci [control]")?;
                self.control_event = Some(event);
                event
            }
        };

        Ok((device, event))
    }

    fn open_data_events(&mut self) -> std::result::Result<(), IoFailure> {
        if self.read_event.is_none() {
            self.read_event = Some(self.create_watched_event("heci.session [read]")?);
        }
        if self.write_event.is_none() {
            self.write_event = Some(self.create_watched_event("heci.session [write]")?);
        }
        Ok(())
    }

    fn create_watched_event(&mut self, metadata: &'static str) -> std::result::Result<WaitEvent, IoFailure> {
        let event = self
            .io
            .create_event()
            .map_err(|e| IoFailure::Device(format!("failed to create wait-event: {}", e)))?;
        if let Err(e) = self.demux.register(event, metadata) {
            self.io.close_event(event);
            return Err(IoFailure::Device(format!(
                "failed to watch wait-event: {}",
                e
            )));
        }
        Ok(event)
    }

    /// Routes a completion signal to the channel owning its wait-event.
    ///
    /// Signals for events that no longer exist are ignored.
    pub fn on_signal(&mut self, signal: Signal) {
        let event = Some(signal.event);
        if event == self.control_event {
            self.on_control_signal(signal.status);
        } else if event == self.read_event {
            self.on_read_signal(signal.status);
        } else if event == self.write_event {
            self.on_write_signal(signal.status);
        } else {
            tracing::trace!(event = ?signal.event, "Ignoring signal for unknown wait-event");
        }
    }

    /// Tears the session down.
    ///
    /// Deregisters and closes every wait-event, then closes the device
    /// handle. Queued operations are abandoned, not flushed. Calling this
    /// again is a no-op.
    pub fn disconnect(&mut self) {
        let mut released = false;

        for slot in [
            &mut self.control_event,
            &mut self.read_event,
            &mut self.write_event,
        ] {
            if let Some(event) = slot.take() {
                self.demux.deregister(event);
                self.io.close_event(event);
                released = true;
            }
        }

        if let Some(device) = self.device.take() {
            self.io.close_device(device);
            released = true;
        }

        self.reader.close();
        self.control.abandon();
        self.writer.abandon();
        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            if released {
                tracing::info!(device = %self.device_path, "Disconnected");
            }
        }
    }
}

impl<D: DeviceIo, M: CompletionDemux, E: SessionEvents> Drop for Session<D, M, E> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
