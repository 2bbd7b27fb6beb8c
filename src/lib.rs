//! kqueue filesystem notification backend
//!
//! kqueue reports changes per open descriptor and cannot say *which* entry appeared in a
//! directory, only that the directory changed. This crate keeps a registry of every watched path
//! and its descriptor, and when a watched directory changes it lists the directory again and
//! announces every entry it had not seen before as a [`Kind::CREATE`] event.
//!
//! # Installation
//!
//! ```toml
//! [dependencies]
//! notify-kevent = "0.1.0"
//! ```
//!
//! ## Features
//!
//! - `serde` for serialization of events
//!
//! # Known Problems
//!
//! ### Directory emulation is best-effort
//!
//! An entry created and removed between two notifications of its directory is never reported.
//!
//! ### Renames
//!
//! A rename is reported as the raw `RENAME`/`DELETE` flags kqueue gives for the old entry plus a
//! synthesized `CREATE` for the new name, never as a single event.
//!
//! ### Network filesystems
//!
//! Network mounted filesystems may not emit any events at all.
//!
//! # Examples
//!
//! ```no_run
//! # #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd",
//! #           target_os = "openbsd", target_os = "netbsd", target_os = "dragonfly"))]
//! # fn main() -> notify_kevent::Result<()> {
//! use notify_kevent::{Config, Kind, RecommendedWatcher, Watcher};
//! use std::path::Path;
//!
//! let watcher = RecommendedWatcher::new(Config::default());
//! watcher.watch(Path::new("."), Kind::WRITE | Kind::DELETE | Kind::RENAME)?;
//!
//! let (tx, rx) = crossbeam_channel::unbounded();
//! let (_stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
//! watcher.fanin(tx, stop_rx)?;
//!
//! for res in rx {
//!     match res {
//!         Ok(event) => println!("event: {:?}", event),
//!         Err(e) => println!("watch error: {:?}", e),
//!     }
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd",
//! #               target_os = "openbsd", target_os = "netbsd", target_os = "dragonfly")))]
//! # fn main() {}
//! ```

#![deny(missing_docs)]

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use event::{Event, Kind, RawEvent};
pub use gateway::{open_descriptor, KernelQueue};
pub use watcher::KqueueWatcher;

use crossbeam_channel::{Receiver, Sender};
use std::path::Path;
use std::thread::JoinHandle;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use crate::kqueue::Kqueue;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;

pub mod event;
pub mod gateway;

mod config;
mod error;
mod monitor;
mod registry;
mod scan;
mod watcher;


/// The watcher running on the host's kernel queue.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub type RecommendedWatcher = KqueueWatcher<Kqueue>;

/// Type that can deliver file activity notifications
///
/// This is the surface a cross-platform front end drives. All methods take `&self`: a watcher may
/// be shared between threads, and calls are serialized internally.
pub trait Watcher {
    /// Begin watching a path for the kinds of changes in `kind`.
    ///
    /// If `path` is a directory, every non-directory entry currently in it is watched too, and
    /// entries added to it later are reported as [`Kind::CREATE`] and watched from then on.
    /// Watching an already watched path widens its interest and is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` cannot be opened or listed, or if the kernel rejects the
    /// registration.
    fn watch(&self, path: &Path, kind: Kind) -> Result<()>;

    /// Stop watching a path.
    ///
    /// For a directory this also drops the interest its entries inherited from it; entries that
    /// were watched on their own keep being watched.
    ///
    /// # Errors
    ///
    /// Returns an error in the case that `path` has not been watched or if removing the watch
    /// fails.
    fn unwatch(&self, path: &Path) -> Result<()>;

    /// Start forwarding events to `output` until `stop` receives a message or disconnects.
    ///
    /// Events reach `output` in the order the kernel reported them. Fatal errors from the monitor
    /// loop arrive in the same stream as `Err` values. When several relays run at once, each
    /// event goes to exactly one of them. Stopping a relay does not stop the watcher.
    fn fanin(&self, output: Sender<Result<Event>>, stop: Receiver<()>) -> Result<JoinHandle<()>>;
}
