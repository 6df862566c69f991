//! # HECI Session Library
//!
//! Asynchronous session engine for the host-embedded controller interface:
//! a firmware service reached through a handle-based device whose I/O
//! completes through OS-signalled wait-events.
//!
//! ## Overview
//!
//! One [`Session`] multiplexes three independent channels over a single
//! device handle:
//!
//! - **Control**: device-control requests, one in flight, FIFO
//! - **Read**: a continuous inbound stream paced by the consumer
//! - **Write**: queued outbound chunks, pipelined or gated by reads
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      SessionHandle / Reactor (tokio)    │  async facade
//! ├─────────────────────────────────────────┤
//! │                 Session                 │  control · read · write
//! ├────────────────────┬────────────────────┤
//! │   DeviceIo         │  CompletionDemux   │  platform boundary
//! ├────────────────────┴────────────────────┤
//! │   backend::mei (Linux) · backend::windows│
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: the session state machine and its three channels
//! - [`gateway`]: native I/O primitives consumed by the session
//! - [`demux`]: completion signals and event registration
//! - [`protocol`]: reserved control codes and client identifiers
//! - [`runtime`]: tokio reactor and handle
//! - [`fault`]: isolation of panicking callbacks
//! - [`backend`]: platform implementations
//! - [`error`]: error types

pub mod backend;
pub mod demux;
pub mod error;
pub mod fault;
pub mod gateway;
pub mod protocol;
pub mod runtime;
pub mod session;

pub use demux::{CompletionDemux, Signal, SignalStatus};
pub use error::{ConnectError, IoFailure, Operation, OsError, Result, SessionError};
pub use gateway::{Completion, DeviceHandle, DeviceIo, StartStatus, WaitEvent};
pub use protocol::{ClientGuid, CLIENT_CONNECT, HECI_VERSION};
pub use session::{
    ConnectOptions, ControlOutcome, Demand, ReadState, Session, SessionEvents, SessionState,
    WaitForFlush, WriteMode,
};
