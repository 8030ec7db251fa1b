//! Event multiplexing: one pollable handle for three native sources.
//!
//! A connection has to surface three independent wakeup sources through a
//! single notifier fd: the connection-manager event channel (resolution
//! progress, disconnect), the completion channel (new CQ entries), and a
//! software "bytes became available" signal that keeps the handle hot
//! after a partial read. An epoll instance aggregates them: an epoll fd
//! polls as readable whenever any registered source has events waiting, so
//! the epoll fd itself is the notifier handed to the owning event loop.
//!
//! The byte signal is a non-blocking pipe carrying 8-byte counts: the
//! completion path writes the number of bytes that arrived, the read path
//! drains the pipe and writes back whatever it did not consume.
//!
//! Linux (epoll) implementation; the connection logic depends only on
//! this module's interface, so another platform's event primitive slots
//! in behind the same type.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const TAG_CM: u64 = 1;
const TAG_CQ: u64 = 2;
const TAG_BUF: u64 = 3;

/// Which sources fired during one check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet {
    pub cm: bool,
    pub cq: bool,
    pub buf: bool,
}

/// Aggregates CM, CQ, and buffer-availability events behind one epoll fd.
pub struct Notifier {
    epoll: OwnedFd,
    pipe_rd: OwnedFd,
    pipe_wr: OwnedFd,
}

impl Notifier {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain fd-creating syscalls; results are checked before
        // ownership is assumed.
        let ep = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ep < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(ep) };

        let mut fds = [0i32; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let pipe_rd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let pipe_wr = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        let notifier = Self {
            epoll,
            pipe_rd,
            pipe_wr,
        };
        notifier.register(notifier.pipe_rd.as_raw_fd(), TAG_BUF)?;
        Ok(notifier)
    }

    fn register(&self, fd: RawFd, tag: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: tag,
        };
        // SAFETY: valid epoll fd and event struct.
        if unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) } != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Watch the connection-manager event channel.
    pub fn watch_cm(&self, fd: RawFd) -> io::Result<()> {
        self.register(fd, TAG_CM)
    }

    /// Watch the completion channel.
    pub fn watch_cq(&self, fd: RawFd) -> io::Result<()> {
        self.register(fd, TAG_CQ)
    }

    /// Non-blocking check of all sources.
    pub fn check(&self) -> io::Result<EventSet> {
        let mut evts = [libc::epoll_event { events: 0, u64: 0 }; 3];
        let n = loop {
            // SAFETY: valid epoll fd, correctly sized event array.
            let n = unsafe {
                libc::epoll_wait(self.epoll.as_raw_fd(), evts.as_mut_ptr(), evts.len() as i32, 0)
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut set = EventSet::default();
        for ev in &evts[..n] {
            match ev.u64 {
                TAG_CM => set.cm = true,
                TAG_CQ => set.cq = true,
                TAG_BUF => set.buf = true,
                tag => unreachable!("unknown notifier tag {tag}"),
            }
        }
        Ok(set)
    }

    /// Record that `n` bytes became available in the sink ring.
    pub fn signal_bytes(&self, n: u64) -> io::Result<()> {
        debug_assert!(n > 0);
        let buf = n.to_ne_bytes();
        // SAFETY: valid fd and buffer.
        let written =
            unsafe { libc::write(self.pipe_wr.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if written == buf.len() as isize {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        // A full pipe means thousands of unconsumed signals are already
        // queued; the handle is as hot as it can get.
        if written < 0 && err.kind() == io::ErrorKind::WouldBlock {
            return Ok(());
        }
        Err(err)
    }

    /// Drain all pending byte counts, returning their sum.
    pub fn take_bytes(&self) -> io::Result<u64> {
        let mut total = 0u64;
        loop {
            let mut buf = [0u8; 8];
            // SAFETY: valid fd and buffer.
            let n =
                unsafe { libc::read(self.pipe_rd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n == buf.len() as isize {
                total += u64::from_ne_bytes(buf);
                continue;
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err),
                }
            } else {
                return Err(io::Error::other("short read on byte-availability pipe"));
            }
        }
        Ok(total)
    }
}

impl AsRawFd for Notifier {
    /// The aggregated handle: readable whenever any source has events.
    fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_notifier_reports_nothing() {
        let n = Notifier::new().unwrap();
        assert_eq!(n.check().unwrap(), EventSet::default());
    }

    #[test]
    fn byte_signal_sets_buf_event() {
        let n = Notifier::new().unwrap();
        n.signal_bytes(100).unwrap();
        let set = n.check().unwrap();
        assert!(set.buf);
        assert!(!set.cm && !set.cq);
        assert_eq!(n.take_bytes().unwrap(), 100);
        // Drained: the event is gone.
        assert_eq!(n.check().unwrap(), EventSet::default());
    }

    #[test]
    fn byte_counts_accumulate() {
        let n = Notifier::new().unwrap();
        n.signal_bytes(1).unwrap();
        n.signal_bytes(2).unwrap();
        n.signal_bytes(39).unwrap();
        assert_eq!(n.take_bytes().unwrap(), 42);
        assert_eq!(n.take_bytes().unwrap(), 0);
    }

    #[test]
    fn putting_back_keeps_handle_hot() {
        let n = Notifier::new().unwrap();
        n.signal_bytes(10).unwrap();
        let got = n.take_bytes().unwrap();
        // Simulate a partial read of 4 bytes.
        n.signal_bytes(got - 4).unwrap();
        assert!(n.check().unwrap().buf);
        assert_eq!(n.take_bytes().unwrap(), 6);
    }

    #[test]
    fn watched_fd_fires_its_tag() {
        let n = Notifier::new().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) },
            0
        );
        let rd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let wr = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        n.watch_cm(rd.as_raw_fd()).unwrap();
        assert!(!n.check().unwrap().cm);

        let one = [1u8];
        assert_eq!(
            unsafe { libc::write(wr.as_raw_fd(), one.as_ptr().cast(), 1) },
            1
        );
        assert!(n.check().unwrap().cm);
    }
}
