//! Kernel queue backed by kqueue(2)
//!
//! The kqueue() system call provides a generic method of notifying the user
//! when an event happens or a condition holds, based on the results of small
//! pieces of kernel code termed filters. Only the vnode filter is used here.
//!
//! Closing a kqueue descriptor is not guaranteed to wake a thread blocked in `kevent` on it, so
//! waiting goes through a `mio::Poll` that also holds a `mio::Waker`; [`Kqueue::shutdown`] fires the
//! waker.

use crate::event::{Kind, RawEvent};
use crate::gateway::KernelQueue;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const KQUEUE: mio::Token = mio::Token(0);
const WAKER: mio::Token = mio::Token(1);

const _: () = assert!(Kind::DELETE.bits() == libc::NOTE_DELETE);
const _: () = assert!(Kind::WRITE.bits() == libc::NOTE_WRITE);
const _: () = assert!(Kind::EXTEND.bits() == libc::NOTE_EXTEND);
const _: () = assert!(Kind::ATTRIB.bits() == libc::NOTE_ATTRIB);
const _: () = assert!(Kind::LINK.bits() == libc::NOTE_LINK);
const _: () = assert!(Kind::RENAME.bits() == libc::NOTE_RENAME);
const _: () = assert!(Kind::REVOKE.bits() == libc::NOTE_REVOKE);

/// A kqueue descriptor watching vnodes.
///
/// Notifications stay in the kernel until [`wait`](KernelQueue::wait) takes them, one per call, so
/// a registration deleted before that point never produces anything.
#[derive(Debug)]
pub struct Kqueue {
    fd: OwnedFd,
    waker: mio::Waker,
    poll: Mutex<mio::Poll>,
    shut_down: AtomicBool,
}

impl Kqueue {
    fn change(&self, fd: RawFd, flags: u16, fflags: u32, token: u64) -> io::Result<()> {
        // SAFETY: an all-zero kevent is a valid value for every field.
        let mut kev: libc::kevent = unsafe { mem::zeroed() };
        kev.ident = fd as _;
        kev.filter = libc::EVFILT_VNODE as _;
        kev.flags = flags as _;
        kev.fflags = fflags;
        kev.udata = token as _;

        let ret = unsafe {
            libc::kevent(
                self.fd.as_raw_fd(),
                &kev,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Takes the next ready notification without blocking.
    fn next_ready(&self) -> io::Result<Option<RawEvent>> {
        let zero = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        loop {
            // SAFETY: see `change`.
            let mut kev: libc::kevent = unsafe { mem::zeroed() };
            let n = unsafe { libc::kevent(self.fd.as_raw_fd(), ptr::null(), 0, &mut kev, 1, &zero) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n == 0 {
                return Ok(None);
            }
            if kev.flags as u32 & libc::EV_ERROR as u32 != 0 {
                log::debug!("kqueue error on fd {}: {}", kev.ident, kev.data);
                continue;
            }
            return Ok(Some(RawEvent {
                ident: kev.ident as RawFd,
                fflags: kev.fflags,
                data: kev.data as i64,
                token: kev.udata as u64,
            }));
        }
    }
}

impl KernelQueue for Kqueue {
    fn open() -> io::Result<Self> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just returned by kqueue() and is owned by nothing else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKER)?;
        let raw = fd.as_raw_fd();
        poll.registry()
            .register(&mut mio::unix::SourceFd(&raw), KQUEUE, mio::Interest::READABLE)?;

        Ok(Kqueue {
            fd,
            waker,
            poll: Mutex::new(poll),
            shut_down: AtomicBool::new(false),
        })
    }

    fn add(&self, fd: RawFd, token: u64, interest: Kind) -> io::Result<()> {
        let flags = (libc::EV_ADD | libc::EV_CLEAR) as u16;
        self.change(fd, flags, interest.kernel_bits(), token)
    }

    fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.change(fd, libc::EV_DELETE as u16, 0, 0)
    }

    fn wait(&self) -> io::Result<Option<RawEvent>> {
        let mut poll = self
            .poll
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "kqueue poll poisoned"))?;
        let mut events = mio::Events::with_capacity(2);

        loop {
            if self.shut_down.load(Ordering::SeqCst) {
                return Ok(None);
            }
            // readiness is edge-triggered, so look before blocking
            if let Some(event) = self.next_ready()? {
                return Ok(Some(event));
            }

            poll.poll(&mut events, None)?;
            if events.iter().any(|event| event.token() == WAKER) {
                self.shut_down.store(true, Ordering::SeqCst);
            }
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        self.waker.wake()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::open_descriptor;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn write_to_registered_file_is_reported() {
        let tmpdir = tempfile::tempdir().expect("tempdir");
        let path = tmpdir.path().join("file");
        std::fs::write(&path, "").expect("create");

        let queue = Kqueue::open().expect("kqueue");
        let file = open_descriptor(&path).expect("open");
        queue
            .add(file.as_raw_fd(), 7, Kind::WRITE | Kind::DELETE)
            .expect("add");

        std::fs::write(&path, "123").expect("write");

        let event = queue.wait().expect("wait").expect("event");
        assert_eq!(event.ident, file.as_raw_fd());
        assert_eq!(event.token, 7);
        assert!(event.kind().contains(Kind::WRITE));
    }

    #[test]
    fn shutdown_wakes_blocked_wait() {
        let queue = Arc::new(Kqueue::open().expect("kqueue"));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait())
        };

        queue.shutdown().expect("shutdown");

        let res = waiter.join().expect("join").expect("wait");
        assert_eq!(res, None);
        assert_eq!(queue.wait().expect("wait"), None);
    }

    #[test]
    fn deleted_registration_leaves_nothing_behind() {
        let tmpdir = tempfile::tempdir().expect("tempdir");
        let a = tmpdir.path().join("a");
        let b = tmpdir.path().join("b");
        std::fs::write(&a, "").expect("create a");
        std::fs::write(&b, "").expect("create b");

        let queue = Kqueue::open().expect("kqueue");
        let fa = open_descriptor(&a).expect("open a");
        let fb = open_descriptor(&b).expect("open b");
        queue.add(fa.as_raw_fd(), 1, Kind::WRITE).expect("add a");
        queue.add(fb.as_raw_fd(), 2, Kind::WRITE).expect("add b");

        std::fs::write(&a, "1").expect("write a");
        std::fs::write(&b, "1").expect("write b");
        queue.delete(fa.as_raw_fd()).expect("delete a");

        let event = queue.wait().expect("wait").expect("event");
        assert_eq!(event.token, 2);
        assert_eq!(queue.next_ready().expect("next"), None);
    }

    #[test]
    fn deleting_unregistered_fd_fails() {
        let tmpdir = tempfile::tempdir().expect("tempdir");
        let queue = Kqueue::open().expect("kqueue");
        let dir = open_descriptor(tmpdir.path()).expect("open");
        assert!(queue.delete(dir.as_raw_fd()).is_err());
    }
}
