use crate::macros::syscall;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

/// A cross-thread wakeup descriptor backed by `eventfd(2)`.
///
/// `EventLoop` registers this descriptor's read side for readability and
/// drains it whenever another thread calls [`Waker::wake`] after queueing a
/// task into the loop's pending-task queue — this is what lets
/// `run_in_loop`/`queue_in_loop` interrupt a blocked `epoll_wait` promptly
/// instead of waiting out the poll timeout.
#[derive(Debug)]
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(Waker { fd })
    }

    /// Writes one unit to the counter, waking a thread blocked reading it.
    /// Idempotent: multiple wakes before the reader drains coalesce into a
    /// single readiness notification, which is fine since the reader always
    /// drains the whole pending-task queue on each wakeup, not one task per
    /// wake.
    pub fn wake(&self) -> io::Result<()> {
        let buf: u64 = 1;
        match syscall!(write(
            self.fd,
            &buf as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )) {
            Ok(_) => Ok(()),
            // the counter is already at u64::MAX; every prior wake is still
            // pending, so this one is redundant.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drains the counter back to zero. Called by the owning loop after
    /// waking from `epoll_wait` on this descriptor's readability.
    pub fn reset(&self) -> io::Result<()> {
        let mut buf: u64 = 0;
        match syscall!(read(
            self.fd,
            &mut buf as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.fd) };
    }
}
