use crate::interest::{Interest, Readiness};
use crate::macros::syscall;
use std::os::unix::io::{AsRawFd, RawFd};
use std::{io, ptr};

/// Thin wrapper around one `epoll` instance.
///
/// One `Selector` is owned by exactly one [`crate::poller::Demultiplexer`],
/// which is in turn owned by exactly one [`crate::event_loop::EventLoop`].
#[derive(Debug)]
pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Selector { epfd })
    }

    pub fn select(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        events.clear();
        let cap = events.capacity() as i32;
        loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.inner.as_mut_ptr(), cap, timeout_ms)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            unsafe { events.inner.set_len(n as usize) };
            return Ok(n as usize);
        }
    }

    /// Registers `fd` for the given interest, tagged with an opaque
    /// `data` word the kernel echoes back in the corresponding event (this
    /// library stores the descriptor itself there, mirroring `EPollPoller`
    /// stashing a raw `Channel*`).
    pub fn register(&self, fd: RawFd, data: u64, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: data,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event)).map(drop)
    }

    pub fn reregister(&self, fd: RawFd, data: u64, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: data,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut event)).map(drop)
    }

    /// Best-effort: `EPOLL_CTL_DEL` failures are logged, not propagated —
    /// removal races with the descriptor being closed are expected and
    /// harmless (the kernel already drops interest on `close(2)`).
    pub fn deregister(&self, fd: RawFd) {
        let res = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut())
        };
        if res == -1 {
            log::warn!(
                "epoll_ctl(EPOLL_CTL_DEL) for fd {} failed: {}",
                fd,
                io::Error::last_os_error()
            );
        }
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.epfd) };
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= libc::EPOLLIN | libc::EPOLLPRI;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT;
    }
    bits as u32
}

/// One readiness event: the opaque `data` word passed to `register` plus
/// the readiness the kernel reported.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub data: u64,
    pub readiness: Readiness,
}

/// Pre-allocated readiness-event storage, starting at 16 entries and
/// doubling whenever a `poll` call fills it completely — this amortizes
/// the cost of large event surges without permanently over-allocating for
/// quiet loops.
#[derive(Debug)]
pub struct Events {
    inner: Vec<libc::epoll_event>,
}

pub const INITIAL_EVENTS_CAPACITY: usize = 16;

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.len() == self.inner.capacity()
    }

    pub fn double_capacity(&mut self) {
        self.inner.reserve(self.inner.capacity());
    }

    fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.inner.iter().map(|raw| Event {
            data: raw.u64,
            readiness: epoll_to_readiness(raw.events as libc::c_int),
        })
    }
}

fn epoll_to_readiness(epoll: libc::c_int) -> Readiness {
    Readiness {
        readable: epoll & (libc::EPOLLIN | libc::EPOLLPRI) != 0,
        writable: epoll & libc::EPOLLOUT != 0,
        hup: epoll & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0,
        error: epoll & libc::EPOLLERR != 0,
    }
}
