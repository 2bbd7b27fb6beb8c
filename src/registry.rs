//! The watch registry.
//!
//! Every watched path has exactly one [`WatchedEntry`], reachable both by path and by the raw
//! descriptor the kernel reports events on. An entry owns its descriptor and lives exactly as long
//! as it has some interest left.
//!
//! Each entry also gets a token that is never reused. The kernel hands it back with every
//! notification, which tells a notification for a removed watch apart from one for whatever entry
//! later got the same descriptor number.

use crate::event::Kind;
use crate::gateway::{open_descriptor, KernelQueue};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Which interest slot of an entry a call is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    /// Requested for this exact path.
    Direct,
    /// Inherited from a watched parent directory.
    Indirect,
}

/// Outcome of [`Registry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    /// The path was not watched before.
    New,
    /// The path was already watched; only its interest was widened.
    Existing,
}

/// Why [`Registry::register`] failed.
#[derive(Debug)]
pub(crate) enum RegisterError {
    /// The path could not be opened; nothing was asked of the kernel.
    Open(io::Error),
    /// The kernel refused the registration.
    Queue(io::Error),
}

impl RegisterError {
    pub fn into_io(self) -> io::Error {
        match self {
            RegisterError::Open(e) | RegisterError::Queue(e) => e,
        }
    }
}

#[derive(Debug)]
pub(crate) struct WatchedEntry {
    path: PathBuf,
    file: File,
    token: u64,
    is_dir: bool,
    direct: Kind,
    indirect: Kind,
}

impl WatchedEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn direct(&self) -> Kind {
        self.direct
    }

    #[cfg(test)]
    pub fn indirect(&self) -> Kind {
        self.indirect
    }

    /// What the kernel registration for this entry reflects.
    #[cfg(test)]
    pub fn interest(&self) -> Kind {
        self.direct | self.indirect
    }

    fn with(&self, slot: Interest, kind: Kind) -> (Kind, Kind) {
        match slot {
            Interest::Direct => (self.direct | kind, self.indirect),
            Interest::Indirect => (self.direct, self.indirect | kind),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    by_path: HashMap<PathBuf, WatchedEntry>,
    by_fd: HashMap<RawFd, PathBuf>,
    /// Last token handed out; tokens start at 1.
    issued: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn lookup_by_path(&self, path: &Path) -> Option<&WatchedEntry> {
        self.by_path.get(path)
    }

    pub fn lookup_by_descriptor(&self, fd: RawFd) -> Option<&WatchedEntry> {
        self.by_fd.get(&fd).and_then(|path| self.by_path.get(path))
    }

    /// Whether `token` was handed to the kernel by this registry at some point.
    pub fn was_issued(&self, token: u64) -> bool {
        token != 0 && token <= self.issued
    }

    /// Adds `kind` to the `slot` interest of `path`, opening and registering it if it is new.
    ///
    /// The kernel is told about the widened interest before the registry changes, so a failed
    /// call leaves the registry as it was.
    pub fn register<Q: KernelQueue>(
        &mut self,
        queue: &Q,
        path: &Path,
        is_dir: bool,
        kind: Kind,
        slot: Interest,
    ) -> Result<Registration, RegisterError> {
        if kind.is_empty() {
            return Err(RegisterError::Queue(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no event kinds requested",
            )));
        }

        if let Some(entry) = self.by_path.get_mut(path) {
            let (direct, indirect) = entry.with(slot, kind);
            queue
                .add(entry.fd(), entry.token, direct | indirect)
                .map_err(RegisterError::Queue)?;
            entry.direct = direct;
            entry.indirect = indirect;
            return Ok(Registration::Existing);
        }

        let file = open_descriptor(path).map_err(RegisterError::Open)?;
        let fd = file.as_raw_fd();
        let token = self.issued + 1;
        log::trace!("adding kqueue watch: {} (fd {})", path.display(), fd);
        queue.add(fd, token, kind).map_err(RegisterError::Queue)?;

        let (direct, indirect) = match slot {
            Interest::Direct => (kind, Kind::empty()),
            Interest::Indirect => (Kind::empty(), kind),
        };
        self.issued = token;
        self.by_fd.insert(fd, path.to_path_buf());
        self.by_path.insert(
            path.to_path_buf(),
            WatchedEntry {
                path: path.to_path_buf(),
                file,
                token,
                is_dir,
                direct,
                indirect,
            },
        );
        Ok(Registration::New)
    }

    /// Clears the `slot` interest of `path`.
    ///
    /// If interest remains in the other slot the kernel registration is narrowed to it, otherwise
    /// the registration is deleted and the entry removed, closing its descriptor. Returns `None`
    /// if `path` is not watched.
    pub fn unregister<Q: KernelQueue>(
        &mut self,
        queue: &Q,
        path: &Path,
        slot: Interest,
    ) -> Option<io::Result<()>> {
        let entry = self.by_path.get_mut(path)?;
        let remaining = match slot {
            Interest::Direct => entry.indirect,
            Interest::Indirect => entry.direct,
        };

        if !remaining.is_empty() {
            return Some(queue.add(entry.fd(), entry.token, remaining).map(|()| match slot {
                Interest::Direct => entry.direct = Kind::empty(),
                Interest::Indirect => entry.indirect = Kind::empty(),
            }));
        }

        log::trace!("removing kqueue watch: {}", path.display());
        if let Err(e) = queue.delete(entry.fd()) {
            return Some(Err(e));
        }
        self.remove(path);
        Some(Ok(()))
    }

    /// Drops `path` from both indices, closing its descriptor.
    ///
    /// A descriptor that is closed has no kernel registration left, so no explicit delete is
    /// issued. Removing an unknown path is a no-op.
    pub fn remove(&mut self, path: &Path) -> Option<WatchedEntry> {
        let entry = self.by_path.remove(path)?;
        self.by_fd.remove(&entry.fd());
        Some(entry)
    }
}
