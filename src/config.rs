//! Configuration types

/// Watcher configuration
///
/// ```rust
/// # use notify_kevent::Config;
/// let config = Config::default()
///     .with_follow_symlinks(false)
///     .with_halt_on_fatal(true);
/// ```
///
/// None of the options can be changed once the watcher is created.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Config {
    /// See [Config::with_follow_symlinks]
    follow_symlinks: bool,

    /// See [Config::with_halt_on_fatal]
    halt_on_fatal: bool,
}

impl Config {
    /// Determine if symbolic links are followed when deciding whether a watched path is a
    /// directory.
    ///
    /// A symlink to a directory is watched as a directory when this is on, and as a plain file
    /// (the link itself) when it is off. On by default.
    pub fn with_follow_symlinks(mut self, follow_symlinks: bool) -> Self {
        self.follow_symlinks = follow_symlinks;
        self
    }

    /// Returns current setting
    pub fn follow_symlinks(&self) -> bool {
        self.follow_symlinks
    }

    /// Decide what the monitor loop does after reporting a fatal error.
    ///
    /// Fatal errors ([`Error::is_fatal`](crate::Error::is_fatal)) are always sent down the event
    /// stream. When this is on, the loop then stops and later `watch`/`unwatch` calls fail with
    /// [`ErrorKind::MonitorHalted`](crate::ErrorKind::MonitorHalted). When off, the loop keeps
    /// going and events may be silently missed from then on.
    ///
    /// On by default.
    pub fn with_halt_on_fatal(mut self, halt_on_fatal: bool) -> Self {
        self.halt_on_fatal = halt_on_fatal;
        self
    }

    /// Returns current setting
    pub fn halt_on_fatal(&self) -> bool {
        self.halt_on_fatal
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            follow_symlinks: true,
            halt_on_fatal: true,
        }
    }
}
