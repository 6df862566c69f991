//! Native backends.
//!
//! Each backend provides a [`DeviceIo`](crate::DeviceIo) gateway and a
//! [`CompletionDemux`](crate::CompletionDemux) that share one signal channel.
//! The receiving end of that channel is handed to
//! [`Reactor::new`](crate::runtime::Reactor::new).

#[cfg(target_os = "linux")]
pub mod mei;
#[cfg(windows)]
pub mod windows;

#[cfg(target_os = "linux")]
pub use mei::{MeiDemux as NativeDemux, MeiIo as NativeIo};
#[cfg(windows)]
pub use windows::{WindowsDemux as NativeDemux, WindowsIo as NativeIo};

/// Device path used when none is configured.
///
/// Windows exposes the interface through a per-machine device path, so it
/// has no usable default.
#[cfg(target_os = "linux")]
pub const DEFAULT_DEVICE_PATH: &str = "/dev/mei0";
#[cfg(not(target_os = "linux"))]
pub const DEFAULT_DEVICE_PATH: &str = "";

/// Opens the backend for the current platform.
///
/// # Errors
/// On Linux this must be called from within a tokio runtime.
#[cfg(any(target_os = "linux", windows))]
pub fn native() -> std::io::Result<(
    NativeIo,
    NativeDemux,
    tokio::sync::mpsc::UnboundedReceiver<crate::demux::Signal>,
)> {
    #[cfg(target_os = "linux")]
    {
        mei::open()
    }
    #[cfg(windows)]
    {
        windows::open()
    }
}
