//! Ownership boundary around the kernel event queue and watched descriptors.
//!
//! Everything that touches the queue descriptor goes through [`KernelQueue`]. Per-path
//! descriptors are plain [`File`]s: whoever owns the `File` owns the descriptor, and it is closed
//! exactly once, when that owner drops it.

use crate::event::{Kind, RawEvent};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::RawFd;
use std::path::Path;

/// A process-wide kernel event queue for vnode notifications.
///
/// Registration methods may be called from any thread, concurrently with a blocked [`wait`].
///
/// [`wait`]: KernelQueue::wait
pub trait KernelQueue: Send + Sync + 'static {
    /// Creates a new, empty queue.
    fn open() -> io::Result<Self>
    where
        Self: Sized;

    /// Registers `fd` for the kinds in `interest`, edge-triggered.
    ///
    /// Every notification for the registration carries `token` back in [`RawEvent::token`].
    /// Registering a descriptor that is already registered replaces its filter set.
    fn add(&self, fd: RawFd, token: u64, interest: Kind) -> io::Result<()>;

    /// Removes the registration for `fd`.
    fn delete(&self, fd: RawFd) -> io::Result<()>;

    /// Blocks until one notification is available, and takes exactly that one from the kernel.
    ///
    /// Returns `Ok(None)` once [`shutdown`](KernelQueue::shutdown) has been called.
    fn wait(&self) -> io::Result<Option<RawEvent>>;

    /// Makes any current and future [`wait`](KernelQueue::wait) return `Ok(None)`.
    fn shutdown(&self) -> io::Result<()>;
}

/// Opens `path` read-only and non-blocking, for use as a registration key.
pub fn open_descriptor(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}
