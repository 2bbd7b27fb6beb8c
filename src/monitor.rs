//! The monitor loop.
//!
//! kqueue only reports events on descriptors it was handed. A directory's descriptor fires a
//! `WRITE` when an entry is added to or removed from it, but the kernel does not say which one.
//! The loop recovers creations by listing the directory again and registering every child it has
//! not seen before, emitting a synthesized [`Kind::CREATE`] for each. Entries created and removed
//! between two notifications are never seen.
//!
//! A notification can be taken from the kernel just before `unwatch` removes its entry. Its token
//! then no longer matches a live entry and it is dropped.

use crate::error::{Error, ErrorKind, Result};
use crate::event::{Event, Kind, RawEvent};
use crate::gateway::KernelQueue;
use crate::registry::{Interest, RegisterError, Registration, Registry};
use crate::scan::scan;
use crossbeam_channel::Sender;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub(crate) struct Monitor<Q> {
    queue: Arc<Q>,
    registry: Arc<Mutex<Registry>>,
    tx: Sender<Result<Event>>,
    halt_on_fatal: bool,
}

impl<Q: KernelQueue> Monitor<Q> {
    pub fn new(
        queue: Arc<Q>,
        registry: Arc<Mutex<Registry>>,
        tx: Sender<Result<Event>>,
        halt_on_fatal: bool,
    ) -> Self {
        Monitor {
            queue,
            registry,
            tx,
            halt_on_fatal,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("notify-kevent monitor".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        loop {
            // The registry lock is not held while blocked here.
            let raw = match self.queue.wait() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    log::debug!("kqueue wait failed, retrying: {}", e);
                    continue;
                }
            };
            log::trace!("kqueue event: {:?}", raw);

            if let Err(err) = self.handle(raw) {
                log::error!("kqueue monitor: {}", err);
                // a poisoned registry never recovers, whatever the config says
                let halt = self.halt_on_fatal || !err.is_fatal();
                let _ = self.tx.send(Err(err));
                if halt {
                    break;
                }
            }
        }
        log::debug!("kqueue monitor stopped");
    }

    /// Translates one kernel notification while holding the registry lock.
    pub fn handle(&self, raw: RawEvent) -> Result<()> {
        let mut registry = self.registry.lock()?;
        translate(&mut registry, &*self.queue, raw, |event| {
            let _ = self.tx.send(Ok(event));
        })
    }
}

/// Turns one kernel notification into the events it implies, updating `registry` on the way.
pub(crate) fn translate<Q, F>(
    registry: &mut Registry,
    queue: &Q,
    raw: RawEvent,
    mut emit: F,
) -> Result<()>
where
    Q: KernelQueue,
    F: FnMut(Event),
{
    let entry = match registry.lookup_by_descriptor(raw.ident) {
        Some(entry) if entry.token() == raw.token => entry,
        _ if registry.was_issued(raw.token) => {
            log::debug!("dropping event for removed watch on fd {}", raw.ident);
            return Ok(());
        }
        _ => return Err(Error::missing_entry(raw.ident)),
    };
    let path = entry.path().to_path_buf();
    let is_dir = entry.is_dir();
    let inherited = entry.direct();
    let kind = raw.kind();

    if !is_dir || kind.contains(Kind::DELETE) {
        emit(Event::from_raw(raw, &path, is_dir));
    } else if kind.contains(Kind::WRITE) && !inherited.is_empty() {
        rescan(registry, queue, &path, inherited, &mut emit)?;
    } else {
        emit(Event::from_raw(raw, &path, is_dir));
    }

    if kind.contains(Kind::DELETE) {
        // the object is gone, and with it any way to register it again
        registry.remove(&path);
    }
    Ok(())
}

fn rescan<Q, F>(
    registry: &mut Registry,
    queue: &Q,
    dir: &Path,
    inherited: Kind,
    emit: &mut F,
) -> Result<()>
where
    Q: KernelQueue,
    F: FnMut(Event),
{
    let result = scan(dir, |child| -> Result<()> {
        match registry.register(queue, &child.path, child.is_dir, inherited, Interest::Indirect) {
            Ok(Registration::New) => {
                emit(
                    Event::new(Kind::CREATE)
                        .set_path(child.path)
                        .set_dir(child.is_dir),
                );
                Ok(())
            }
            Ok(Registration::Existing) => Ok(()),
            Err(RegisterError::Open(e)) => {
                log::debug!("not watching {}: {}", child.path.display(), e);
                Ok(())
            }
            Err(RegisterError::Queue(e)) => Err(Error::emulation(e).add_path(child.path)),
        }
    });

    match result {
        Err(Error {
            kind: ErrorKind::PathNotFound,
            ..
        }) => {
            // its DELETE notification is next in the queue
            log::debug!("{} vanished before it could be listed", dir.display());
            Ok(())
        }
        Err(Error {
            kind: ErrorKind::Io(e),
            ..
        }) => Err(Error::emulation(e).add_path(dir.to_path_buf())),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{raw, testdir, FakeQueue};
    use pretty_assertions::assert_eq;
    use std::os::unix::net::UnixListener;
    use std::path::PathBuf;

    struct Fixture {
        _tmpdir: tempfile::TempDir,
        dir: PathBuf,
        queue: FakeQueue,
        registry: Registry,
    }

    impl Fixture {
        /// A directory watched for `kind`, the way `watch` leaves it.
        fn watched_dir(kind: Kind) -> Self {
            let tmpdir = testdir();
            let dir = tmpdir.path().to_path_buf();
            let queue = FakeQueue::new();
            let mut registry = Registry::new();
            registry
                .register(&queue, &dir, true, kind, Interest::Direct)
                .expect("register dir");
            Fixture {
                _tmpdir: tmpdir,
                dir,
                queue,
                registry,
            }
        }

        fn fd_of(&self, path: &Path) -> i32 {
            self.registry.lookup_by_path(path).expect("watched").fd()
        }

        fn translate(&mut self, raw: RawEvent) -> Result<Vec<Event>> {
            let mut events = Vec::new();
            translate(&mut self.registry, &self.queue, raw, |e| events.push(e))?;
            Ok(events)
        }
    }

    #[test]
    fn new_file_in_watched_dir_is_created_once() {
        let mut fx = Fixture::watched_dir(Kind::WRITE | Kind::DELETE);
        let file = fx.dir.join("new");
        std::fs::write(&file, "").expect("write");

        let dir_fd = fx.fd_of(&fx.dir);
        let events = fx.translate(fx.queue.event(dir_fd, Kind::WRITE)).expect("translate");

        assert_eq!(
            events,
            vec![Event::new(Kind::CREATE).set_path(file.clone()).set_dir(false)]
        );
        let entry = fx.registry.lookup_by_path(&file).expect("child watched");
        assert_eq!(entry.direct(), Kind::empty());
        assert_eq!(entry.indirect(), Kind::WRITE | Kind::DELETE);
        assert_eq!(fx.queue.interest(entry.fd()), Some(Kind::WRITE | Kind::DELETE));
    }

    #[test]
    fn second_write_without_new_children_is_silent() {
        let mut fx = Fixture::watched_dir(Kind::WRITE);
        std::fs::write(fx.dir.join("new"), "").expect("write");
        let dir_fd = fx.fd_of(&fx.dir);

        assert_eq!(fx.translate(fx.queue.event(dir_fd, Kind::WRITE)).expect("first").len(), 1);
        assert!(fx.translate(fx.queue.event(dir_fd, Kind::WRITE)).expect("second").is_empty());
        assert_eq!(fx.registry.len(), 2);
    }

    #[test]
    fn new_subdirectory_is_created_as_directory() {
        let mut fx = Fixture::watched_dir(Kind::WRITE);
        let sub = fx.dir.join("sub");
        std::fs::create_dir(&sub).expect("mkdir");

        let dir_fd = fx.fd_of(&fx.dir);
        let events = fx.translate(fx.queue.event(dir_fd, Kind::WRITE)).expect("translate");

        assert_eq!(events, vec![Event::new(Kind::CREATE).set_path(sub.clone()).set_dir(true)]);
        assert!(fx.registry.lookup_by_path(&sub).expect("watched").is_dir());
    }

    #[test]
    fn deleted_dir_is_reported_once_and_not_rescanned() {
        let mut fx = Fixture::watched_dir(Kind::WRITE | Kind::DELETE);
        // would be announced if a scan happened
        std::fs::write(fx.dir.join("new"), "").expect("write");
        let dir_fd = fx.fd_of(&fx.dir);
        let delete = fx.queue.event(dir_fd, Kind::DELETE | Kind::WRITE);

        let events = fx.translate(delete).expect("translate");

        assert_eq!(events, vec![Event::from_raw(delete, &fx.dir, true)]);
        assert!(fx.registry.lookup_by_path(&fx.dir).is_none());
        assert!(fx.registry.lookup_by_descriptor(dir_fd).is_none());
        assert_eq!(fx.registry.len(), 0);
    }

    #[test]
    fn file_events_are_forwarded_with_payload() {
        let mut fx = Fixture::watched_dir(Kind::WRITE);
        let file = fx.dir.join("file");
        std::fs::write(&file, "").expect("write");
        fx.registry
            .register(&fx.queue, &file, false, Kind::WRITE | Kind::DELETE, Interest::Direct)
            .expect("register file");
        let fd = fx.fd_of(&file);

        let write = fx.queue.event(fd, Kind::WRITE | Kind::EXTEND);
        assert_eq!(
            fx.translate(write).expect("write"),
            vec![Event::from_raw(write, &file, false)]
        );

        let delete = fx.queue.event(fd, Kind::DELETE);
        assert_eq!(
            fx.translate(delete).expect("delete"),
            vec![Event::from_raw(delete, &file, false)]
        );
        assert!(fx.registry.lookup_by_path(&file).is_none());
    }

    #[test]
    fn other_directory_events_are_forwarded_once() {
        let mut fx = Fixture::watched_dir(Kind::ATTRIB | Kind::WRITE);
        std::fs::write(fx.dir.join("a"), "").expect("a");
        std::fs::write(fx.dir.join("b"), "").expect("b");
        let dir_fd = fx.fd_of(&fx.dir);
        let attrib = fx.queue.event(dir_fd, Kind::ATTRIB);

        assert_eq!(
            fx.translate(attrib).expect("translate"),
            vec![Event::from_raw(attrib, &fx.dir, true)]
        );
        assert_eq!(fx.registry.len(), 1);
    }

    #[test]
    fn unknown_descriptor_is_fatal() {
        let mut fx = Fixture::watched_dir(Kind::WRITE);
        let err = fx.translate(raw(9999, Kind::WRITE)).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MissingEntry(9999)));
        assert!(err.is_fatal());
    }

    #[test]
    fn failed_child_registration_is_fatal() {
        let mut fx = Fixture::watched_dir(Kind::WRITE);
        let file = fx.dir.join("new");
        std::fs::write(&file, "").expect("write");
        let dir_fd = fx.fd_of(&fx.dir);

        fx.queue.fail_next_add();
        let err = fx.translate(fx.queue.event(dir_fd, Kind::WRITE)).unwrap_err();

        assert!(matches!(err.kind, ErrorKind::Emulation(_)));
        assert_eq!(err.paths, vec![file.clone()]);
        assert!(fx.registry.lookup_by_path(&file).is_none());
    }

    #[test]
    fn indirectly_watched_dir_forwards_writes() {
        let mut fx = Fixture::watched_dir(Kind::WRITE);
        let sub = fx.dir.join("sub");
        std::fs::create_dir(&sub).expect("mkdir");
        let dir_fd = fx.fd_of(&fx.dir);
        fx.translate(fx.queue.event(dir_fd, Kind::WRITE)).expect("discover sub");

        std::fs::write(sub.join("deep"), "").expect("deep");
        let sub_write = fx.queue.event(fx.fd_of(&sub), Kind::WRITE);

        assert_eq!(
            fx.translate(sub_write).expect("translate"),
            vec![Event::from_raw(sub_write, &sub, true)]
        );
        assert!(fx.registry.lookup_by_path(&sub.join("deep")).is_none());
    }

    #[test]
    fn event_for_removed_watch_is_dropped() {
        let mut fx = Fixture::watched_dir(Kind::WRITE);
        let file = fx.dir.join("file");
        std::fs::write(&file, "").expect("write");
        fx.registry
            .register(&fx.queue, &file, false, Kind::WRITE, Interest::Direct)
            .expect("register file");
        let stale = fx.queue.event(fx.fd_of(&file), Kind::WRITE);

        fx.registry
            .unregister(&fx.queue, &file, Interest::Direct)
            .expect("watched")
            .expect("unregister");

        assert!(fx.translate(stale).expect("not fatal").is_empty());
    }

    #[test]
    fn stale_event_is_not_reported_for_reused_descriptor() {
        let mut fx = Fixture::watched_dir(Kind::WRITE);
        let old = fx.dir.join("old");
        let new = fx.dir.join("new");
        std::fs::write(&old, "").expect("old");
        std::fs::write(&new, "").expect("new");
        fx.registry
            .register(&fx.queue, &old, false, Kind::WRITE, Interest::Direct)
            .expect("register old");
        let stale = fx.queue.event(fx.fd_of(&old), Kind::WRITE);
        fx.registry.remove(&old);

        fx.registry
            .register(&fx.queue, &new, false, Kind::WRITE, Interest::Direct)
            .expect("register new");
        let new_fd = fx.fd_of(&new);
        // as if the kernel had handed the number out again
        let stale = RawEvent {
            ident: new_fd,
            ..stale
        };
        let fresh = fx.queue.event(new_fd, Kind::WRITE);

        assert!(fx.translate(stale).expect("stale").is_empty());
        assert_eq!(
            fx.translate(fresh).expect("fresh"),
            vec![Event::from_raw(fresh, &new, false)]
        );
    }

    #[test]
    fn unopenable_child_is_skipped_and_siblings_are_created() {
        let mut fx = Fixture::watched_dir(Kind::WRITE);
        let socket = fx.dir.join("sock");
        let _listener = UnixListener::bind(&socket).expect("bind");
        let file = fx.dir.join("file");
        std::fs::write(&file, "").expect("write");

        let dir_fd = fx.fd_of(&fx.dir);
        let events = fx.translate(fx.queue.event(dir_fd, Kind::WRITE)).expect("not fatal");

        assert_eq!(
            events,
            vec![Event::new(Kind::CREATE).set_path(file.clone()).set_dir(false)]
        );
        assert!(fx.registry.lookup_by_path(&socket).is_none());
        assert!(fx.registry.lookup_by_path(&file).is_some());
    }

    #[test]
    fn rapid_create_and_remove_between_notifications_is_missed() {
        let mut fx = Fixture::watched_dir(Kind::WRITE);
        let file = fx.dir.join("blink");
        std::fs::write(&file, "").expect("write");
        std::fs::remove_file(&file).expect("remove");
        let dir_fd = fx.fd_of(&fx.dir);

        assert!(fx.translate(fx.queue.event(dir_fd, Kind::WRITE)).expect("translate").is_empty());
    }
}
