/// Logs and aborts the process.
///
/// `mymuduo`'s `LOG_FATAL` macro logs at fatal level and then calls
/// `exit(0)`; programmer errors (thread-affinity violations, socket/epoll
/// creation failure, a second event loop on a thread that already has one)
/// are not recoverable and must not be allowed to silently continue.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort();
    }};
}

/// Turns a libc call's `-1` return into `io::Error::last_os_error()`.
/// Does not retry on `EINTR`; callers for whom that matters (e.g.
/// `epoll_wait`) loop explicitly.
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* )) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use fatal;
pub(crate) use syscall;
