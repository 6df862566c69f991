//! Windows overlapped I/O backend.
//!
//! Every wait-event owns a heap-allocated slot holding its `OVERLAPPED`
//! structure and the buffers lent to the operation in flight, so the memory
//! the kernel writes into stays put until the result is collected. The
//! demultiplexer registers each event with the thread pool
//! (`RegisterWaitForSingleObject`) and forwards firings into the signal
//! channel. Events are auto-reset, so each completion fires exactly once.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::io;
use std::ptr;

use tokio::sync::mpsc;
use windows_sys::Win32::Foundation::{
    CloseHandle, BOOLEAN, ERROR_INVALID_HANDLE, ERROR_IO_INCOMPLETE,
    ERROR_IO_PENDING, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileA, ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::{CancelIoEx, DeviceIoControl, GetOverlappedResult, OVERLAPPED};
use windows_sys::Win32::System::Threading::{
    CreateEventA, RegisterWaitForSingleObject, UnregisterWaitEx, INFINITE, WT_EXECUTEDEFAULT,
};

use crate::demux::{CompletionDemux, Signal};
use crate::error::OsError;
use crate::gateway::{Completion, DeviceHandle, DeviceIo, StartStatus, WaitEvent};

fn as_handle(raw: usize) -> HANDLE {
    raw as HANDLE
}

/// Opens the Windows backend.
pub fn open() -> io::Result<(WindowsIo, WindowsDemux, mpsc::UnboundedReceiver<Signal>)> {
    let (signals, rx) = mpsc::unbounded_channel();
    let io = WindowsIo {
        slots: HashMap::new(),
        devices: Vec::new(),
    };
    let demux = WindowsDemux {
        signals,
        waits: HashMap::new(),
    };
    Ok((io, demux, rx))
}

/// Per-event state the kernel may write into while an operation is pending.
struct Slot {
    overlapped: OVERLAPPED,
    /// Device the pending operation was issued on.
    device: Option<DeviceHandle>,
    /// Read target, write source, or control output.
    buffer: Option<Vec<u8>>,
    /// Control input, kept alive until completion.
    input: Option<Vec<u8>>,
}

impl Slot {
    fn new() -> Box<Self> {
        Box::new(Self {
            // SAFETY: OVERLAPPED is plain data; all-zero is its initial state.
            overlapped: unsafe { std::mem::zeroed() },
            device: None,
            buffer: None,
            input: None,
        })
    }

    fn arm(&mut self, event: WaitEvent, device: DeviceHandle) -> *mut OVERLAPPED {
        // SAFETY: see `Slot::new`.
        self.overlapped = unsafe { std::mem::zeroed() };
        self.overlapped.hEvent = as_handle(event.0);
        self.device = Some(device);
        &mut self.overlapped
    }

    fn is_pending(&self) -> bool {
        self.device.is_some()
    }
}

/// [`DeviceIo`] over `CreateFile`/`ReadFile`/`WriteFile`/`DeviceIoControl`.
pub struct WindowsIo {
    slots: HashMap<WaitEvent, Box<Slot>>,
    devices: Vec<DeviceHandle>,
}

// Safe because the raw handles and OVERLAPPED pointers are only touched by
// the thread currently owning the gateway.
unsafe impl Send for WindowsIo {}

impl WindowsIo {
    /// Interprets the return of an overlapped call.
    fn started(&mut self, event: WaitEvent, ok: i32) -> StartStatus {
        if ok != 0 {
            return StartStatus::Completed;
        }
        let error = OsError::last();
        if error.code() == ERROR_IO_PENDING as i32 {
            return StartStatus::Pending;
        }
        if let Some(slot) = self.slots.get_mut(&event) {
            slot.device = None;
            slot.buffer = None;
            slot.input = None;
        }
        StartStatus::Failed(error)
    }

    /// Cancels the operation pending on `slot` and waits for the kernel to
    /// release its buffers.
    fn cancel(slot: &mut Slot) {
        let Some(device) = slot.device.take() else {
            return;
        };
        let mut transferred = 0u32;
        // SAFETY: the OVERLAPPED belongs to an operation issued on `device`,
        // and the slot outlives both calls.
        unsafe {
            CancelIoEx(as_handle(device.0), &slot.overlapped);
            GetOverlappedResult(as_handle(device.0), &slot.overlapped, &mut transferred, 1);
        }
        slot.buffer = None;
        slot.input = None;
    }
}

impl DeviceIo for WindowsIo {
    fn open_device(&mut self, path: &str) -> Result<DeviceHandle, OsError> {
        let path = CString::new(path).map_err(|_| OsError(ERROR_INVALID_HANDLE as i32))?;
        // SAFETY: `path` is NUL-terminated and outlives the call.
        let handle = unsafe {
            CreateFileA(
                path.as_ptr() as *const u8,
                GENERIC_READ | GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(OsError::last());
        }

        let device = DeviceHandle(handle as usize);
        self.devices.push(device);
        tracing::debug!(device = device.0, "Opened device handle");
        Ok(device)
    }

    fn create_event(&mut self) -> Result<WaitEvent, OsError> {
        // SAFETY: anonymous auto-reset event, initially unsignalled.
        let handle = unsafe { CreateEventA(ptr::null(), 0, 0, ptr::null()) };
        if handle.is_null() {
            return Err(OsError::last());
        }
        let event = WaitEvent(handle as usize);
        self.slots.insert(event, Slot::new());
        Ok(event)
    }

    fn start_read(&mut self, device: DeviceHandle, event: WaitEvent, mut buffer: Vec<u8>) -> StartStatus {
        let Some(slot) = self.slots.get_mut(&event) else {
            return StartStatus::Failed(OsError(ERROR_INVALID_HANDLE as i32));
        };
        let overlapped = slot.arm(event, device);
        let (data, len) = (buffer.as_mut_ptr(), buffer.len() as u32);
        slot.buffer = Some(buffer);

        // SAFETY: the buffer and OVERLAPPED live in the boxed slot until the
        // completion is collected or the operation is cancelled.
        let ok = unsafe { ReadFile(as_handle(device.0), data, len, ptr::null_mut(), overlapped) };
        self.started(event, ok)
    }

    fn start_write(&mut self, device: DeviceHandle, event: WaitEvent, data: Vec<u8>) -> StartStatus {
        let Some(slot) = self.slots.get_mut(&event) else {
            return StartStatus::Failed(OsError(ERROR_INVALID_HANDLE as i32));
        };
        let overlapped = slot.arm(event, device);
        let (source, len) = (data.as_ptr(), data.len() as u32);
        slot.buffer = Some(data);

        // SAFETY: as for `start_read`.
        let ok = unsafe { WriteFile(as_handle(device.0), source, len, ptr::null_mut(), overlapped) };
        self.started(event, ok)
    }

    fn start_control(
        &mut self,
        device: DeviceHandle,
        event: WaitEvent,
        code: u32,
        input: Vec<u8>,
        mut output: Vec<u8>,
    ) -> StartStatus {
        let Some(slot) = self.slots.get_mut(&event) else {
            return StartStatus::Failed(OsError(ERROR_INVALID_HANDLE as i32));
        };
        let overlapped = slot.arm(event, device);
        let (in_ptr, in_len) = (input.as_ptr() as *const c_void, input.len() as u32);
        let (out_ptr, out_len) = (output.as_mut_ptr() as *mut c_void, output.len() as u32);
        slot.input = Some(input);
        slot.buffer = Some(output);

        // SAFETY: as for `start_read`; both buffers are parked in the slot.
        let ok = unsafe {
            DeviceIoControl(
                as_handle(device.0),
                code,
                in_ptr,
                in_len,
                out_ptr,
                out_len,
                ptr::null_mut(),
                overlapped,
            )
        };
        self.started(event, ok)
    }

    fn completion(&mut self, device: DeviceHandle, event: WaitEvent) -> Completion {
        let Some(slot) = self.slots.get_mut(&event) else {
            return Completion::failed(Vec::new(), OsError(ERROR_INVALID_HANDLE as i32));
        };
        if !slot.is_pending() {
            return Completion::failed(Vec::new(), OsError(ERROR_IO_INCOMPLETE as i32));
        }

        let mut transferred = 0u32;
        // SAFETY: non-blocking query of the operation bound to this slot.
        let ok = unsafe {
            GetOverlappedResult(as_handle(device.0), &slot.overlapped, &mut transferred, 0)
        };
        if ok == 0 {
            let error = OsError::last();
            if error.code() == ERROR_IO_INCOMPLETE as i32 {
                return Completion::failed(Vec::new(), error);
            }
            slot.device = None;
            slot.input = None;
            return Completion::failed(slot.buffer.take().unwrap_or_default(), error);
        }

        slot.device = None;
        slot.input = None;
        Completion {
            buffer: slot.buffer.take().unwrap_or_default(),
            result: Ok(transferred),
        }
    }

    fn close_event(&mut self, event: WaitEvent) {
        let Some(mut slot) = self.slots.remove(&event) else {
            return;
        };
        Self::cancel(&mut slot);
        // SAFETY: the event was created by `create_event` and no operation
        // references it any more.
        unsafe { CloseHandle(as_handle(event.0)) };
    }

    fn close_device(&mut self, device: DeviceHandle) {
        let Some(index) = self.devices.iter().position(|d| *d == device) else {
            return;
        };
        self.devices.swap_remove(index);

        for slot in self.slots.values_mut() {
            if slot.device == Some(device) {
                Self::cancel(slot);
            }
        }
        // SAFETY: opened by `open_device`; closed exactly once.
        unsafe { CloseHandle(as_handle(device.0)) };
        tracing::debug!(device = device.0, "Closed device handle");
    }
}

impl Drop for WindowsIo {
    fn drop(&mut self) {
        let events: Vec<WaitEvent> = self.slots.keys().copied().collect();
        for event in events {
            self.close_event(event);
        }
        for device in std::mem::take(&mut self.devices) {
            // SAFETY: still open; nothing references it after the slots are gone.
            unsafe { CloseHandle(as_handle(device.0)) };
        }
    }
}

/// Context handed to the thread-pool wait callback.
struct WaitContext {
    event: WaitEvent,
    metadata: &'static str,
    signals: mpsc::UnboundedSender<Signal>,
}

unsafe extern "system" fn on_wait(context: *mut c_void, timed_out: BOOLEAN) {
    // SAFETY: `context` points at the boxed WaitContext registered with this
    // wait; `deregister` waits for running callbacks before freeing it.
    let context = unsafe { &*(context as *const WaitContext) };
    let signal = if timed_out != 0 {
        Signal::failed(context.event, "timed out")
    } else {
        Signal::ready(context.event)
    };
    tracing::trace!(event = context.event.0, metadata = context.metadata, "Wait-event signalled");
    let _ = context.signals.send(signal);
}

struct Registration {
    wait: usize,
    context: Box<WaitContext>,
}

/// [`CompletionDemux`] backed by thread-pool waits.
pub struct WindowsDemux {
    signals: mpsc::UnboundedSender<Signal>,
    waits: HashMap<WaitEvent, Registration>,
}

impl CompletionDemux for WindowsDemux {
    fn register(&mut self, event: WaitEvent, metadata: &'static str) -> Result<(), OsError> {
        let context = Box::new(WaitContext {
            event,
            metadata,
            signals: self.signals.clone(),
        });
        let mut wait: HANDLE = ptr::null_mut();
        // SAFETY: the context box is kept in `waits` until the wait is
        // unregistered with `UnregisterWaitEx(.., INVALID_HANDLE_VALUE)`.
        let ok = unsafe {
            RegisterWaitForSingleObject(
                &mut wait,
                as_handle(event.0),
                Some(on_wait),
                &*context as *const WaitContext as *const c_void,
                INFINITE,
                WT_EXECUTEDEFAULT,
            )
        };
        if ok == 0 {
            return Err(OsError::last());
        }

        tracing::trace!(event = event.0, metadata, "Watching wait-event");
        self.waits.insert(
            event,
            Registration {
                wait: wait as usize,
                context,
            },
        );
        Ok(())
    }

    fn deregister(&mut self, event: WaitEvent) {
        let Some(registration) = self.waits.remove(&event) else {
            return;
        };
        // SAFETY: blocks until in-progress callbacks return, after which the
        // context can be dropped.
        unsafe { UnregisterWaitEx(as_handle(registration.wait), INVALID_HANDLE_VALUE) };
        tracing::trace!(
            event = event.0,
            metadata = registration.context.metadata,
            "Stopped watching wait-event"
        );
    }
}

impl Drop for WindowsDemux {
    fn drop(&mut self) {
        let events: Vec<WaitEvent> = self.waits.keys().copied().collect();
        for event in events {
            self.deregister(event);
        }
    }
}
