//! Watcher implementation on top of a [`KernelQueue`]
//!
//! Watching a directory watches the directory itself and, indirectly, every non-directory entry in
//! it. Entries that appear later are picked up by the monitor loop and announced as
//! [`Kind::CREATE`].

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, Kind};
use crate::gateway::KernelQueue;
use crate::monitor::Monitor;
use crate::registry::{Interest, RegisterError, Registry};
use crate::scan::scan;
use crate::Watcher;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Watcher implementation based on a kernel event queue
///
/// The queue and the monitor thread are only created on the first [`watch`](Watcher::watch).
/// Dropping the watcher stops the monitor thread.
pub struct KqueueWatcher<Q: KernelQueue> {
    config: Config,
    registry: Arc<Mutex<Registry>>,
    runtime: Mutex<Runtime<Q>>,
    event_tx: Sender<Result<Event>>,
    event_rx: Receiver<Result<Event>>,
}

struct Runtime<Q> {
    pending: Option<Q>,
    queue: Option<Arc<Q>>,
    monitor: Option<JoinHandle<()>>,
}

impl<Q> Runtime<Q> {
    /// Returns the queue if the monitor was started, or an error if it has since halted.
    fn running(&self) -> Result<Option<Arc<Q>>> {
        match (&self.queue, &self.monitor) {
            (Some(_), Some(monitor)) if monitor.is_finished() => Err(Error::monitor_halted()),
            (Some(queue), _) => Ok(Some(Arc::clone(queue))),
            _ => Ok(None),
        }
    }
}

impl<Q: KernelQueue> KqueueWatcher<Q> {
    /// Create a new watcher; its queue is opened with [`KernelQueue::open`] on first use.
    pub fn new(config: Config) -> Self {
        Self::from_runtime(None, config)
    }

    /// Create a new watcher that will use `queue`.
    pub fn with_queue(queue: Q, config: Config) -> Self {
        Self::from_runtime(Some(queue), config)
    }

    fn from_runtime(pending: Option<Q>, config: Config) -> Self {
        let (event_tx, event_rx) = unbounded();
        KqueueWatcher {
            config,
            registry: Arc::new(Mutex::new(Registry::new())),
            runtime: Mutex::new(Runtime {
                pending,
                queue: None,
                monitor: None,
            }),
            event_tx,
            event_rx,
        }
    }

    /// Returns the running queue, starting it and the monitor thread if needed.
    fn start(&self) -> Result<Arc<Q>> {
        let mut runtime = self.runtime.lock()?;
        if let Some(queue) = runtime.running()? {
            return Ok(queue);
        }

        let queue = match runtime.pending.take() {
            Some(queue) => queue,
            None => Q::open()?,
        };
        let queue = Arc::new(queue);
        let monitor = Monitor::new(
            Arc::clone(&queue),
            Arc::clone(&self.registry),
            self.event_tx.clone(),
            self.config.halt_on_fatal(),
        )
        .spawn()?;

        runtime.queue = Some(Arc::clone(&queue));
        runtime.monitor = Some(monitor);
        Ok(queue)
    }

    fn is_dir(&self, path: &Path) -> Result<bool> {
        let metadata = if self.config.follow_symlinks() {
            fs::metadata(path)
        } else {
            fs::symlink_metadata(path)
        };
        metadata
            .map(|m| m.is_dir())
            .map_err(|e| Error::io(e).add_path(path.to_path_buf()))
    }

    fn watch_inner(&self, path: &Path, kind: Kind) -> Result<()> {
        let path = absolute(path)?;
        if kind.kernel_bits() == 0 {
            return Err(Error::generic("no kernel event kinds requested").add_path(path));
        }

        let queue = self.start()?;
        let is_dir = self.is_dir(&path)?;

        let mut registry = self.registry.lock()?;
        registry
            .register(&*queue, &path, is_dir, kind, Interest::Direct)
            .map_err(|e| Error::io(e.into_io()).add_path(path.clone()))?;

        if is_dir {
            scan(&path, |child| -> Result<()> {
                if child.is_dir {
                    return Ok(());
                }
                match registry.register(&*queue, &child.path, false, kind, Interest::Indirect) {
                    Ok(_) => Ok(()),
                    Err(RegisterError::Open(e)) => {
                        log::debug!("not watching {}: {}", child.path.display(), e);
                        Ok(())
                    }
                    Err(RegisterError::Queue(e)) => Err(Error::io(e).add_path(child.path)),
                }
            })?;
        }
        Ok(())
    }

    fn unwatch_inner(&self, path: &Path) -> Result<()> {
        let path = absolute(path)?;
        let queue = match self.runtime.lock()?.running()? {
            Some(queue) => queue,
            None => return Err(Error::watch_not_found().add_path(path)),
        };

        let mut registry = self.registry.lock()?;
        let is_dir = match registry.lookup_by_path(&path) {
            Some(entry) => entry.is_dir(),
            None => return Err(Error::watch_not_found().add_path(path)),
        };

        if is_dir {
            scan(&path, |child| -> Result<()> {
                match registry.unregister(&*queue, &child.path, Interest::Indirect) {
                    Some(Err(e)) => Err(Error::io(e).add_path(child.path)),
                    Some(Ok(())) | None => Ok(()),
                }
            })?;
        }

        match registry.unregister(&*queue, &path, Interest::Direct) {
            Some(result) => result.map_err(|e| Error::io(e).add_path(path)),
            None => Err(Error::watch_not_found().add_path(path)),
        }
    }

    fn fanin_inner(
        &self,
        output: Sender<Result<Event>>,
        stop: Receiver<()>,
    ) -> Result<JoinHandle<()>> {
        let events = self.event_rx.clone();
        thread::Builder::new()
            .name("notify-kevent fanin".to_string())
            .spawn(move || relay(events, output, stop))
            .map_err(Error::io)
    }
}

impl<Q: KernelQueue> Watcher for KqueueWatcher<Q> {
    fn watch(&self, path: &Path, kind: Kind) -> Result<()> {
        self.watch_inner(path, kind)
    }

    fn unwatch(&self, path: &Path) -> Result<()> {
        self.unwatch_inner(path)
    }

    fn fanin(&self, output: Sender<Result<Event>>, stop: Receiver<()>) -> Result<JoinHandle<()>> {
        self.fanin_inner(output, stop)
    }
}

impl<Q: KernelQueue> fmt::Debug for KqueueWatcher<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KqueueWatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<Q: KernelQueue> Drop for KqueueWatcher<Q> {
    fn drop(&mut self) {
        let runtime = match self.runtime.get_mut() {
            Ok(runtime) => runtime,
            Err(poisoned) => poisoned.into_inner(),
        };
        let queue = match runtime.queue.take() {
            Some(queue) => queue,
            None => return,
        };

        if let Err(e) = queue.shutdown() {
            // joining would block forever
            log::warn!("failed to shut down kqueue monitor: {}", e);
            return;
        }
        if let Some(monitor) = runtime.monitor.take() {
            if monitor.join().is_err() {
                log::error!("kqueue monitor panicked");
            }
        }
    }
}

/// Copies events to `output` until `stop` fires or either side disconnects.
fn relay(events: Receiver<Result<Event>>, output: Sender<Result<Event>>, stop: Receiver<()>) {
    loop {
        let event = select! {
            recv(events) -> event => match event {
                Ok(event) => event,
                Err(_) => return,
            },
            recv(stop) -> _ => return,
        };
        select! {
            send(output, event) -> sent => if sent.is_err() {
                return;
            },
            recv(stop) -> _ => return,
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_owned())
    } else {
        let p = env::current_dir().map_err(Error::io)?;
        Ok(p.join(path))
    }
}
