// This file is dual-licensed under the Artistic License 2.0 as per the
// LICENSE.ARTISTIC file, and the Creative Commons Zero 1.0 license.
//! The `Event` type and the `Kind` bitmask.

use bitflags::bitflags;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

bitflags! {
    /// Kinds of filesystem changes.
    ///
    /// Every bit except [`Kind::CREATE`] is the host's `NOTE_*` vnode flag and is handed to the
    /// kernel verbatim. Bits the kernel reports that have no name here are preserved.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    #[cfg_attr(feature = "serde", serde(transparent))]
    pub struct Kind: u32 {
        /// The object was unlinked.
        const DELETE = 0x0000_0001;
        /// The object's contents changed. For a directory: an entry was added or removed.
        const WRITE = 0x0000_0002;
        /// The object grew.
        const EXTEND = 0x0000_0004;
        /// The object's attributes changed.
        const ATTRIB = 0x0000_0008;
        /// The object's link count changed.
        const LINK = 0x0000_0010;
        /// The object was renamed.
        const RENAME = 0x0000_0020;
        /// Access to the object was revoked, or its filesystem was unmounted.
        const REVOKE = 0x0000_0040;

        /// A new entry appeared inside a watched directory.
        ///
        /// Never reported by the kernel; the watcher infers it by re-listing the directory.
        const CREATE = 0x4000_0000;

        /// Every kind the kernel can report.
        const ALL_KERNEL = Self::DELETE.bits()
            | Self::WRITE.bits()
            | Self::EXTEND.bits()
            | Self::ATTRIB.bits()
            | Self::LINK.bits()
            | Self::RENAME.bits()
            | Self::REVOKE.bits();
    }
}

impl Kind {
    /// The bits passed to the kernel for this interest.
    pub fn kernel_bits(self) -> u32 {
        self.difference(Kind::CREATE).bits()
    }

    /// Kind as reported by the kernel, unknown bits included.
    pub fn from_kernel(fflags: u32) -> Self {
        Kind::from_bits_retain(fflags)
    }
}

/// One raw notification as read from the kernel queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawEvent {
    /// Descriptor the notification fired on.
    pub ident: RawFd,

    /// Filter-specific flags, i.e. the `NOTE_*` bits that fired.
    pub fflags: u32,

    /// Filter-specific data.
    pub data: i64,

    /// Registration the notification belongs to, as passed to [`KernelQueue::add`].
    ///
    /// A descriptor number can be reused once its watch is gone; the token cannot.
    ///
    /// [`KernelQueue::add`]: crate::KernelQueue::add
    pub token: u64,
}

impl RawEvent {
    /// The reported flags as a [`Kind`].
    pub fn kind(&self) -> Kind {
        Kind::from_kernel(self.fflags)
    }
}

/// Event delivered to consumers.
///
/// An event that maps one-to-one onto a kernel notification carries that notification in `raw`.
/// Events the watcher inferred itself, such as creations, have no `raw` payload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Event {
    /// Kind of the event.
    pub kind: Kind,

    /// Absolute path the event is about.
    pub path: PathBuf,

    /// Whether `path` is a directory.
    pub is_dir: bool,

    /// The kernel notification this event was built from, if any.
    #[cfg_attr(feature = "serde", serde(default))]
    pub raw: Option<RawEvent>,
}

impl Event {
    /// Creates a new `Event` given a kind.
    pub fn new(kind: Kind) -> Self {
        Event {
            kind,
            path: PathBuf::new(),
            is_dir: false,
            raw: None,
        }
    }

    /// Creates an event that forwards a kernel notification for `path`.
    pub fn from_raw(raw: RawEvent, path: &Path, is_dir: bool) -> Self {
        Event::new(raw.kind())
            .set_path(path.to_path_buf())
            .set_dir(is_dir)
            .set_raw(raw)
    }

    /// Sets the path of the event.
    pub fn set_path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Sets the directory flag of the event.
    pub fn set_dir(mut self, is_dir: bool) -> Self {
        self.is_dir = is_dir;
        self
    }

    /// Attaches the kernel notification the event originated from.
    pub fn set_raw(mut self, raw: RawEvent) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Whether the watcher inferred this event rather than the kernel reporting it.
    pub fn is_synthesized(&self) -> bool {
        self.raw.is_none()
    }
}
