//! Error types

use std::error::Error as StdError;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::{fmt, io, result};

/// Type alias to use this library's `Error` type in a Result
pub type Result<T> = result::Result<T, Error>;

/// Error kinds
#[derive(Debug)]
pub enum ErrorKind {
    /// Generic error
    ///
    /// May be used in cases where a platform specific error is mapped to this type, or for opaque
    /// internal errors.
    Generic(String),

    /// I/O errors.
    Io(io::Error),

    /// A path does not exist.
    PathNotFound,

    /// Attempted to remove a watch that does not exist.
    WatchNotFound,

    /// The kernel reported an event for a registration the watcher never made.
    ///
    /// Events for watches that were removed on purpose are dropped, not reported as this.
    ///
    /// The registry and the kernel queue disagree, so nothing the watcher reports afterwards can
    /// be trusted.
    MissingEntry(RawFd),

    /// A directory re-scan found a child that could not be registered with the kernel.
    ///
    /// Events for that child will be missed from now on.
    Emulation(io::Error),

    /// The monitor loop has stopped after a fatal error and no longer delivers events.
    MonitorHalted,
}

/// Notify error type.
///
/// Errors are emitted either at creation time of a `Watcher`, or during the event stream. They
/// range from kernel errors to filesystem errors to argument errors.
///
/// Errors can be general, or they can be about specific paths or subtrees. In that later case, the
/// error's `paths` field will be populated.
#[derive(Debug)]
pub struct Error {
    /// Kind of the error.
    pub kind: ErrorKind,

    /// Relevant paths to the error, if any.
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Adds a path to the error.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Replaces the paths for the error.
    pub fn set_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }

    /// Creates a new Error with empty paths given its kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    /// Creates a new generic Error from a message.
    pub fn generic(msg: &str) -> Self {
        Self::new(ErrorKind::Generic(msg.into()))
    }

    /// Creates a new i/o Error from a stdlib `io::Error`.
    ///
    /// A `NotFound` error becomes [`ErrorKind::PathNotFound`].
    pub fn io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::path_not_found()
        } else {
            Self::new(ErrorKind::Io(err))
        }
    }

    /// Creates a new "path not found" error.
    pub fn path_not_found() -> Self {
        Self::new(ErrorKind::PathNotFound)
    }

    /// Creates a new "watch not found" error.
    pub fn watch_not_found() -> Self {
        Self::new(ErrorKind::WatchNotFound)
    }

    /// Creates a new "missing entry" error for a descriptor the kernel reported.
    pub fn missing_entry(fd: RawFd) -> Self {
        Self::new(ErrorKind::MissingEntry(fd))
    }

    /// Creates a new emulation error from the failed child registration.
    pub fn emulation(err: io::Error) -> Self {
        Self::new(ErrorKind::Emulation(err))
    }

    /// Creates a new "monitor halted" error.
    pub fn monitor_halted() -> Self {
        Self::new(ErrorKind::MonitorHalted)
    }

    /// Whether the error means the watcher's state can no longer be trusted.
    ///
    /// Fatal errors only ever come out of the monitor loop, through the event stream.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::MissingEntry(_) | ErrorKind::Emulation(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error = match self.kind {
            ErrorKind::PathNotFound => "No path was found.".into(),
            ErrorKind::WatchNotFound => "No watch was found.".into(),
            ErrorKind::MonitorHalted => "The monitor loop has halted.".into(),
            ErrorKind::MissingEntry(fd) => {
                format!("Kernel reported descriptor {} which is not being watched.", fd)
            }
            ErrorKind::Emulation(ref err) => format!("Directory emulation failed: {}", err),
            ErrorKind::Generic(ref err) => err.clone(),
            ErrorKind::Io(ref err) => err.to_string(),
        };

        if self.paths.is_empty() {
            write!(f, "{}", error)
        } else {
            write!(f, "{} about {:?}", error, self.paths)
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self.kind {
            ErrorKind::Io(ref cause) | ErrorKind::Emulation(ref cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::generic(&format!("internal lock poisoned: {}", err))
    }
}
