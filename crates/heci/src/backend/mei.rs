//! Linux MEI character device backend.
//!
//! The device is opened non-blocking and registered with the tokio reactor.
//! Every read or write start spawns a task that waits for readiness, performs
//! the syscall, stores the [`Completion`] under its wait-event and emits a
//! [`Signal`] if the event is still watched. Wait-events are plain
//! identifiers here; nothing in the kernel backs them.
//!
//! `CLIENT_CONNECT` maps onto `IOCTL_MEI_CONNECT_CLIENT`, which completes
//! synchronously. The driver has no equivalent for other control codes, so
//! they complete with `ENOTTY`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use nix::errno::Errno;
use nix::libc;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::demux::{CompletionDemux, Signal};
use crate::error::OsError;
use crate::gateway::{Completion, DeviceHandle, DeviceIo, StartStatus, WaitEvent};
use crate::protocol;

mod sys {
    /// `struct mei_connect_client_data`: the client GUID going in, the
    /// client properties (maximum message length first) coming out.
    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ConnectClientData {
        pub bytes: [u8; 16],
    }

    nix::ioctl_readwrite!(mei_connect_client, b'H', 0x01, ConnectClientData);
}

struct Shared {
    runtime: Handle,
    signals: mpsc::UnboundedSender<Signal>,
    next_id: AtomicUsize,
    devices: DashMap<DeviceHandle, Arc<AsyncFd<File>>>,
    results: DashMap<WaitEvent, Completion>,
    tasks: DashMap<WaitEvent, (DeviceHandle, AbortHandle)>,
    watched: DashMap<WaitEvent, &'static str>,
}

impl Shared {
    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn complete(&self, event: WaitEvent, completion: Completion) {
        self.results.insert(event, completion);
        self.tasks.remove(&event);

        match self.watched.get(&event) {
            Some(metadata) => {
                tracing::trace!(event = event.0, metadata = *metadata, "Wait-event signalled");
                if self.signals.send(Signal::ready(event)).is_err() {
                    tracing::debug!(event = event.0, "Signal receiver dropped");
                }
            }
            None => tracing::trace!(event = event.0, "Completion for unwatched wait-event"),
        }
    }
}

/// Opens the MEI backend on the current tokio runtime.
///
/// # Errors
/// Fails when called outside a tokio runtime.
pub fn open() -> io::Result<(MeiIo, MeiDemux, mpsc::UnboundedReceiver<Signal>)> {
    let runtime = Handle::try_current().map_err(io::Error::other)?;
    let (signals, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        runtime,
        signals,
        next_id: AtomicUsize::new(1),
        devices: DashMap::new(),
        results: DashMap::new(),
        tasks: DashMap::new(),
        watched: DashMap::new(),
    });

    let io = MeiIo {
        shared: Arc::clone(&shared),
    };
    let demux = MeiDemux { shared };
    Ok((io, demux, rx))
}

/// [`DeviceIo`] over `/dev/mei*`.
pub struct MeiIo {
    shared: Arc<Shared>,
}

impl MeiIo {
    fn device(&self, device: DeviceHandle) -> Option<Arc<AsyncFd<File>>> {
        self.shared.devices.get(&device).map(|fd| Arc::clone(&fd))
    }

    fn track(&self, device: DeviceHandle, event: WaitEvent, task: AbortHandle) {
        if !task.is_finished() {
            self.shared.tasks.insert(event, (device, task));
        }
    }
}

async fn read_ready(fd: &AsyncFd<File>, buffer: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| inner.get_ref().read(buffer)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn write_ready(fd: &AsyncFd<File>, data: &[u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.writable().await?;
        match guard.try_io(|inner| inner.get_ref().write(data)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

fn transferred(result: io::Result<usize>) -> Result<u32, OsError> {
    result
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .map_err(OsError::from)
}

impl DeviceIo for MeiIo {
    fn open_device(&mut self, path: &str) -> Result<DeviceHandle, OsError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;

        let _enter = self.shared.runtime.enter();
        let fd = AsyncFd::new(file)?;

        let handle = DeviceHandle(self.shared.next_id());
        tracing::debug!(path, fd = fd.as_raw_fd(), "Opened MEI device");
        self.shared.devices.insert(handle, Arc::new(fd));
        Ok(handle)
    }

    fn create_event(&mut self) -> Result<WaitEvent, OsError> {
        Ok(WaitEvent(self.shared.next_id()))
    }

    fn start_read(&mut self, device: DeviceHandle, event: WaitEvent, mut buffer: Vec<u8>) -> StartStatus {
        let Some(fd) = self.device(device) else {
            return StartStatus::Failed(OsError(libc::EBADF));
        };

        let shared = Arc::clone(&self.shared);
        let task = self.shared.runtime.spawn(async move {
            let result = read_ready(&fd, &mut buffer).await;
            shared.complete(
                event,
                Completion {
                    buffer,
                    result: transferred(result),
                },
            );
        });
        self.track(device, event, task.abort_handle());
        StartStatus::Pending
    }

    fn start_write(&mut self, device: DeviceHandle, event: WaitEvent, data: Vec<u8>) -> StartStatus {
        let Some(fd) = self.device(device) else {
            return StartStatus::Failed(OsError(libc::EBADF));
        };

        let shared = Arc::clone(&self.shared);
        let task = self.shared.runtime.spawn(async move {
            let result = write_ready(&fd, &data).await;
            shared.complete(
                event,
                Completion {
                    buffer: data,
                    result: transferred(result),
                },
            );
        });
        self.track(device, event, task.abort_handle());
        StartStatus::Pending
    }

    fn start_control(
        &mut self,
        device: DeviceHandle,
        event: WaitEvent,
        code: u32,
        input: Vec<u8>,
        mut output: Vec<u8>,
    ) -> StartStatus {
        let Some(fd) = self.device(device) else {
            return StartStatus::Failed(OsError(libc::EBADF));
        };

        let completion = if code != protocol::CLIENT_CONNECT {
            tracing::debug!(code = format_args!("{:#010x}", code), "Control code not supported by MEI");
            Completion::failed(output, OsError(Errno::ENOTTY as i32))
        } else if input.len() != 16 {
            Completion::failed(output, OsError(Errno::EINVAL as i32))
        } else {
            let mut data = sys::ConnectClientData::default();
            data.bytes.copy_from_slice(&input);

            // SAFETY: `data` is a valid, exclusively borrowed 16-byte buffer for
            // the duration of the call, and the fd stays open while `fd` is held.
            match unsafe { sys::mei_connect_client(fd.as_raw_fd(), &mut data) } {
                Ok(_) => {
                    let n = output.len().min(data.bytes.len());
                    output[..n].copy_from_slice(&data.bytes[..n]);
                    Completion {
                        buffer: output,
                        result: Ok(n as u32),
                    }
                }
                Err(errno) => Completion::failed(output, OsError(errno as i32)),
            }
        };

        self.shared.complete(event, completion);
        StartStatus::Completed
    }

    fn completion(&mut self, _device: DeviceHandle, event: WaitEvent) -> Completion {
        match self.shared.results.remove(&event) {
            Some((_, completion)) => completion,
            None => Completion::failed(Vec::new(), OsError(libc::EINPROGRESS)),
        }
    }

    fn close_event(&mut self, event: WaitEvent) {
        if let Some((_, (_, task))) = self.shared.tasks.remove(&event) {
            task.abort();
        }
        self.shared.results.remove(&event);
    }

    fn close_device(&mut self, device: DeviceHandle) {
        self.shared.tasks.retain(|_, (owner, task)| {
            if *owner == device {
                task.abort();
                false
            } else {
                true
            }
        });
        if self.shared.devices.remove(&device).is_some() {
            tracing::debug!(device = device.0, "Closed MEI device");
        }
    }
}

impl Drop for MeiIo {
    fn drop(&mut self) {
        for task in self.shared.tasks.iter() {
            task.value().1.abort();
        }
        self.shared.tasks.clear();
    }
}

/// [`CompletionDemux`] for [`MeiIo`]: tracks which wait-events may signal.
pub struct MeiDemux {
    shared: Arc<Shared>,
}

impl CompletionDemux for MeiDemux {
    fn register(&mut self, event: WaitEvent, metadata: &'static str) -> Result<(), OsError> {
        tracing::trace!(event = event.0, metadata, "Watching wait-event");
        self.shared.watched.insert(event, metadata);
        Ok(())
    }

    fn deregister(&mut self, event: WaitEvent) {
        if let Some((_, metadata)) = self.shared.watched.remove(&event) {
            tracing::trace!(event = event.0, metadata, "Stopped watching wait-event");
        }
    }
}
