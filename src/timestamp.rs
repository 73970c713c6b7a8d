use std::fmt;
use std::time::SystemTime;

/// A point in time captured immediately after a [`Demultiplexer::poll`] call
/// returns, threaded through to the read callback so a connection's message
/// handler can timestamp when data became readable without an extra syscall.
///
/// [`Demultiplexer::poll`]: crate::poller::Demultiplexer::poll
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    pub fn now() -> Timestamp {
        Timestamp(SystemTime::now())
    }

    pub fn inner(&self) -> SystemTime {
        self.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => write!(f, "Timestamp({}.{:06})", d.as_secs(), d.subsec_micros()),
            Err(_) => write!(f, "Timestamp(before-epoch)"),
        }
    }
}
