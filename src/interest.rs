use std::ops::{BitOr, BitOrAssign};

/// A channel's registered interest: readable (which on this platform also
/// carries urgent/priority data), writable, or neither.
///
/// Mirrors `Channel`'s `kNoneEvent` / `kReadEvent` / `kWriteEvent` constants
/// in the original: read interest always includes `EPOLLPRI` since the two
/// are never distinguished by any caller in this library.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// The readiness `poll` reported for a channel: a superset of `Interest`
/// because the kernel can also report hangup and error independent of what
/// was requested.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hup: bool,
    pub error: bool,
}

impl Readiness {
    pub fn is_none(&self) -> bool {
        !self.readable && !self.writable && !self.hup && !self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_has_no_interest() {
        assert!(Interest::NONE.is_none());
        assert!(!Interest::NONE.is_readable());
        assert!(!Interest::NONE.is_writable());
    }

    #[test]
    fn combining_interests() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!both.is_none());
    }

    #[test]
    fn removing_an_interest() {
        let both = Interest::READABLE | Interest::WRITABLE;
        let read_only = both.remove(Interest::WRITABLE);
        assert!(read_only.is_readable());
        assert!(!read_only.is_writable());
    }
}
