//! Native I/O gateway.
//!
//! The session never talks to the platform directly. Everything that touches
//! a native handle goes through [`DeviceIo`], which mirrors the overlapped I/O
//! primitives of the host: open a device by path, start an asynchronous
//! read/write/control operation bound to a wait-event, fetch the result of a
//! completed operation, and close handles.
//!
//! Buffers are moved into the gateway when an operation starts and handed back
//! in the [`Completion`]. While the operation is outstanding the OS may write
//! into that memory, so nothing else may hold it.

use crate::error::OsError;

/// Opaque handle to an opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub usize);

/// Opaque handle to a native wait-event signalled when an operation finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitEvent(pub usize);

/// Outcome of starting an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    /// The operation was queued; its wait-event fires later.
    Pending,
    /// The operation finished immediately; its wait-event is signalled anyway.
    Completed,
    /// The operation was rejected and will never signal.
    Failed(OsError),
}

/// Result of a finished operation, retrieved after its wait-event fired.
#[derive(Debug)]
pub struct Completion {
    /// The buffer that was lent to the operation.
    pub buffer: Vec<u8>,
    /// Number of bytes transferred, or why the count is unavailable.
    pub result: Result<u32, OsError>,
}

impl Completion {
    /// A completion whose byte count could not be retrieved.
    pub fn failed(buffer: Vec<u8>, error: OsError) -> Self {
        Self {
            buffer,
            result: Err(error),
        }
    }
}

/// Primitives consumed from the platform.
///
/// Implementations must never block: a start call either completes
/// immediately or reports [`StartStatus::Pending`].
pub trait DeviceIo {
    /// Opens the device at `path` for overlapped read/write access.
    fn open_device(&mut self, path: &str) -> Result<DeviceHandle, OsError>;

    /// Creates a wait-event usable with one operation at a time.
    fn create_event(&mut self) -> Result<WaitEvent, OsError>;

    /// Starts reading up to `buffer.len()` bytes.
    fn start_read(&mut self, device: DeviceHandle, event: WaitEvent, buffer: Vec<u8>) -> StartStatus;

    /// Starts writing all of `data`.
    fn start_write(&mut self, device: DeviceHandle, event: WaitEvent, data: Vec<u8>) -> StartStatus;

    /// Starts a device-control request; the response lands in `output`.
    fn start_control(
        &mut self,
        device: DeviceHandle,
        event: WaitEvent,
        code: u32,
        input: Vec<u8>,
        output: Vec<u8>,
    ) -> StartStatus;

    /// Retrieves the result of the operation bound to `event` without waiting.
    fn completion(&mut self, device: DeviceHandle, event: WaitEvent) -> Completion;

    /// Closes a wait-event.
    fn close_event(&mut self, event: WaitEvent);

    /// Closes a device handle.
    fn close_device(&mut self, device: DeviceHandle);
}
