//! Async facade over a [`Session`].
//!
//! A [`Reactor`] owns the session and drives it from one task: completion
//! signals from the backend and commands from [`SessionHandle`]s are taken
//! one at a time, so the session keeps its single thread of control while
//! callers use ordinary `async` calls.
//!
//! ```rust,no_run
//! # async fn demo<D: heci::DeviceIo, M: heci::CompletionDemux>(
//! #     io: D,
//! #     demux: M,
//! #     signals: tokio::sync::mpsc::UnboundedReceiver<heci::Signal>,
//! # ) -> Result<(), heci::runtime::HandleError> {
//! use heci::runtime::{Reactor, SessionEvent};
//! use heci::{ClientGuid, ConnectOptions};
//!
//! let (reactor, mut handle) = Reactor::new(io, demux, "/dev/mei0", signals, 16);
//! let client = async move {
//!     handle.connect(ClientGuid::AMT, ConnectOptions::default()).await?;
//!     handle.write(vec![0x01, 0x00]).await?;
//!     if let Some(SessionEvent::Data(reply)) = handle.recv().await {
//!         println!("{} bytes", reply.len());
//!     }
//!     handle.disconnect().await;
//!     Ok::<_, heci::runtime::HandleError>(())
//! };
//! let (_, result) = tokio::join!(reactor.run(), client);
//! result
//! # }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::demux::{CompletionDemux, Signal};
use crate::error::{ConnectError, IoFailure, SessionError};
use crate::gateway::DeviceIo;
use crate::protocol::ClientGuid;
use crate::session::{ConnectOptions, ControlOutcome, Demand, Session, SessionEvents};

/// Default number of undelivered inbound messages before reads pause.
pub const DEFAULT_READ_QUEUE_DEPTH: usize = 16;

/// Notification forwarded from the session to its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake succeeded.
    Connected {
        /// Negotiated maximum message size.
        max_message_size: u32,
    },
    /// Handshake failed.
    Error(ConnectError),
    /// An inbound message (copied out of the read buffer).
    Data(Vec<u8>),
    /// The inbound stream ended.
    End,
}

/// Errors surfaced by [`SessionHandle`].
#[derive(Debug, Error)]
pub enum HandleError {
    /// The session rejected the operation.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The connect handshake failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The inbound stream ended while waiting for the handshake.
    #[error("stream ended before the session connected")]
    Ended,

    /// The reactor is no longer running.
    #[error("session reactor stopped")]
    ReactorStopped,
}

/// [`SessionEvents`] sink forwarding into a channel.
///
/// Answers [`Demand::Pause`] once `depth` messages are buffered and not yet
/// received by the handle.
pub struct ChannelEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
    buffered: Arc<AtomicUsize>,
    depth: usize,
}

impl ChannelEvents {
    fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Session handle dropped, discarding notification");
        }
    }
}

impl SessionEvents for ChannelEvents {
    fn on_connected(&mut self, max_message_size: u32) {
        self.send(SessionEvent::Connected { max_message_size });
    }

    fn on_error(&mut self, error: &ConnectError) {
        self.send(SessionEvent::Error(error.clone()));
    }

    fn on_data(&mut self, data: &[u8]) -> Demand {
        let buffered = self.buffered.fetch_add(1, Ordering::SeqCst) + 1;
        self.send(SessionEvent::Data(data.to_vec()));
        if buffered < self.depth {
            Demand::More
        } else {
            tracing::debug!(buffered, "Inbound queue full, pausing reads");
            Demand::Pause
        }
    }

    fn on_end(&mut self) {
        self.send(SessionEvent::End);
    }
}

enum Command {
    Connect {
        client: ClientGuid,
        options: ConnectOptions,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Write {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), SessionError>>,
        retired: oneshot::Sender<Result<(), IoFailure>>,
    },
    Control {
        code: u32,
        input: Vec<u8>,
        output_capacity: usize,
        reply: oneshot::Sender<Result<(), SessionError>>,
        done: oneshot::Sender<ControlOutcome>,
    },
    Pull,
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Drives a session from completion signals and handle commands.
pub struct Reactor<D: DeviceIo, M: CompletionDemux> {
    session: Session<D, M, ChannelEvents>,
    signals: mpsc::UnboundedReceiver<Signal>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<D: DeviceIo, M: CompletionDemux> Reactor<D, M> {
    /// Builds a reactor and the handle controlling it.
    ///
    /// `signals` is the channel the backend's demultiplexer feeds.
    pub fn new(
        io: D,
        demux: M,
        device_path: impl Into<String>,
        signals: mpsc::UnboundedReceiver<Signal>,
        read_queue_depth: usize,
    ) -> (Self, SessionHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));

        let events = ChannelEvents {
            tx: event_tx,
            buffered: Arc::clone(&buffered),
            depth: read_queue_depth.max(1),
        };
        let reactor = Reactor {
            session: Session::new(io, demux, device_path, events),
            signals,
            commands: command_rx,
        };
        let handle = SessionHandle {
            commands: command_tx,
            events: event_rx,
            buffered,
        };
        (reactor, handle)
    }

    /// Runs until the handle disconnects or is dropped.
    pub async fn run(mut self) {
        tracing::debug!(device = %self.session.device_path(), "Session reactor started");
        loop {
            tokio::select! {
                Some(signal) = self.signals.recv() => self.session.on_signal(signal),
                command = self.commands.recv() => {
                    let running = match command {
                        Some(command) => self.handle(command),
                        None => {
                            self.session.disconnect();
                            false
                        }
                    };
                    if !running {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Session reactor stopped");
    }

    /// Applies one command; returns whether the reactor keeps running.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Connect {
                client,
                options,
                reply,
            } => {
                let _ = reply.send(self.session.connect(client, options));
            }
            Command::Write {
                data,
                reply,
                retired,
            } => {
                let queued = self.session.write_tracked(data, move |outcome| {
                    let _ = retired.send(outcome);
                });
                let _ = reply.send(queued.map(|_| ()));
            }
            Command::Control {
                code,
                input,
                output_capacity,
                reply,
                done,
            } => {
                let queued = self
                    .session
                    .send_control(code, input, output_capacity, move |_, outcome| {
                        let _ = done.send(outcome);
                    });
                let _ = reply.send(queued);
            }
            Command::Pull => self.session.pull(),
            Command::Disconnect { reply } => {
                self.session.disconnect();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }
}

/// Caller side of a [`Reactor`].
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    buffered: Arc<AtomicUsize>,
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<(), HandleError> {
        self.commands
            .send(command)
            .map_err(|_| HandleError::ReactorStopped)
    }

    /// Connects and waits for the handshake; returns the maximum message size.
    pub async fn connect(
        &mut self,
        client: ClientGuid,
        options: ConnectOptions,
    ) -> Result<u32, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            client,
            options,
            reply,
        })?;
        rx.await.map_err(|_| HandleError::ReactorStopped)??;

        loop {
            match self.events.recv().await {
                Some(SessionEvent::Connected { max_message_size }) => return Ok(max_message_size),
                Some(SessionEvent::Error(err)) => return Err(err.into()),
                Some(SessionEvent::End) => return Err(HandleError::Ended),
                Some(SessionEvent::Data(_)) => {
                    tracing::warn!("Discarding data received before connect completed");
                }
                None => return Err(HandleError::ReactorStopped),
            }
        }
    }

    /// Writes `data` and waits until this write leaves the write queue.
    ///
    /// Concurrent writes each resolve on their own. If the write channel
    /// fails first the write resolves with [`SessionError::WriteFailed`]; a
    /// write abandoned by teardown fails with [`SessionError::Closed`].
    pub async fn write(&self, data: Vec<u8>) -> Result<(), HandleError> {
        let (reply, queued) = oneshot::channel();
        let (retired, retired_rx) = oneshot::channel();
        self.send(Command::Write {
            data,
            reply,
            retired,
        })?;
        queued.await.map_err(|_| HandleError::ReactorStopped)??;
        retired_rx
            .await
            .map_err(|_| HandleError::Session(SessionError::Closed))?
            .map_err(|failure| HandleError::Session(SessionError::WriteFailed(failure)))
    }

    /// Issues a raw control request and waits for its outcome.
    pub async fn control(
        &self,
        code: u32,
        input: Vec<u8>,
        output_capacity: usize,
    ) -> Result<ControlOutcome, HandleError> {
        let (reply, queued) = oneshot::channel();
        let (done, done_rx) = oneshot::channel();
        self.send(Command::Control {
            code,
            input,
            output_capacity,
            reply,
            done,
        })?;
        queued.await.map_err(|_| HandleError::ReactorStopped)??;
        done_rx
            .await
            .map_err(|_| HandleError::Session(SessionError::Closed))
    }

    /// Receives the next notification, re-arming the read pipeline after data.
    ///
    /// Returns `None` once the reactor has stopped.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        let event = self.events.recv().await?;
        if matches!(event, SessionEvent::Data(_)) {
            self.buffered.fetch_sub(1, Ordering::SeqCst);
            let _ = self.send(Command::Pull);
        }
        Some(event)
    }

    /// Tears the session down and stops the reactor.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}
