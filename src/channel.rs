use crate::callbacks::{noop_callbacks, ChannelCallbacks, EventCallback, ReadCallback};
use crate::interest::{Interest, Readiness};
use crate::poller::RegistrationState;
use crate::timestamp::Timestamp;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

pub type SharedChannel = Rc<RefCell<Channel>>;

/// Binds one file descriptor to the callbacks interested in its readiness,
/// and tracks the interest currently registered with the owning
/// [`crate::poller::Demultiplexer`].
///
/// A `Channel` never owns the descriptor itself — closing `fd` is the
/// owner's ([`crate::connection::Connection`], [`crate::acceptor::Acceptor`],
/// the wakeup [`crate::sys::Waker`]) responsibility.
pub struct Channel {
    fd: RawFd,
    interest: Interest,
    revents: Readiness,
    state: RegistrationState,
    /// When set, [`dispatch`] skips every callback once this no longer
    /// upgrades — the owner that called [`Channel::tie`] has been dropped,
    /// so firing callbacks into it would be use-after-free in spirit even
    /// though Rust's ownership model has already made that impossible; this
    /// instead makes it a silent no-op, matching the original's intent.
    tie: Option<Weak<()>>,
    callbacks: ChannelCallbacks,
}

impl Channel {
    pub fn new(fd: RawFd, callbacks: ChannelCallbacks) -> Channel {
        Channel {
            fd,
            interest: Interest::NONE,
            revents: Readiness::default(),
            state: RegistrationState::New,
            tie: None,
            callbacks,
        }
    }

    pub fn with_noop_callbacks(fd: RawFd) -> Channel {
        Channel::new(fd, noop_callbacks())
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.state
    }

    pub fn set_registration_state(&mut self, state: RegistrationState) {
        self.state = state;
    }

    pub fn set_revents(&mut self, revents: Readiness) {
        self.revents = revents;
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    pub fn enable_reading(&mut self) {
        self.interest |= Interest::READABLE;
    }

    pub fn disable_reading(&mut self) {
        self.interest = self.interest.remove(Interest::READABLE);
    }

    pub fn enable_writing(&mut self) {
        self.interest |= Interest::WRITABLE;
    }

    pub fn disable_writing(&mut self) {
        self.interest = self.interest.remove(Interest::WRITABLE);
    }

    pub fn disable_all(&mut self) {
        self.interest = Interest::NONE;
    }

    pub fn set_read_callback(&mut self, cb: ReadCallback) {
        self.callbacks.read = cb;
    }

    pub fn set_write_callback(&mut self, cb: EventCallback) {
        self.callbacks.write = cb;
    }

    pub fn set_close_callback(&mut self, cb: EventCallback) {
        self.callbacks.close = cb;
    }

    pub fn set_error_callback(&mut self, cb: EventCallback) {
        self.callbacks.error = cb;
    }

    /// Ties this channel's callback dispatch to `marker`'s lifetime, so a
    /// readiness event that arrives after `marker`'s owner has been dropped
    /// (but before the channel itself is unregistered) is silently
    /// dropped instead of running a callback whose captured state may be
    /// half-torn-down.
    pub fn tie(&mut self, marker: &Rc<()>) {
        self.tie = Some(Rc::downgrade(marker));
    }

    fn take_callbacks(&mut self) -> ChannelCallbacks {
        std::mem::replace(&mut self.callbacks, noop_callbacks())
    }

    fn restore_callbacks(&mut self, callbacks: ChannelCallbacks) {
        self.callbacks = callbacks;
    }
}

/// Runs the callbacks appropriate for `channel`'s last-reported readiness,
/// in order: close (on hangup without readability), error, read, write. A
/// hangup with no readable data only ever fires close — the other three are
/// skipped for that dispatch.
///
/// Callbacks are taken out of the channel for the duration of the call so
/// that a callback which reaches back into the same channel (e.g. to
/// disable an interest) does not re-borrow a `RefCell` already borrowed by
/// this function.
pub fn dispatch(channel: &SharedChannel, time: Timestamp) {
    if let Some(tie) = channel.borrow().tie.clone() {
        if tie.upgrade().is_none() {
            return;
        }
    }

    let revents = channel.borrow().revents;
    let mut callbacks = channel.borrow_mut().take_callbacks();

    if revents.hup && !revents.readable {
        (callbacks.close)();
        channel.borrow_mut().restore_callbacks(callbacks);
        return;
    }
    if revents.error {
        (callbacks.error)();
    }
    if revents.readable {
        (callbacks.read)(time);
    }
    if revents.writable {
        (callbacks.write)();
    }

    channel.borrow_mut().restore_callbacks(callbacks);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn enabling_and_disabling_interests() {
        let mut channel = Channel::with_noop_callbacks(0);
        assert!(!channel.is_reading());
        channel.enable_reading();
        assert!(channel.is_reading());
        channel.enable_writing();
        assert!(channel.is_writing());
        channel.disable_writing();
        assert!(!channel.is_writing());
        assert!(channel.is_reading());
        channel.disable_all();
        assert!(!channel.is_reading());
    }

    #[test]
    fn dispatch_calls_read_then_write_on_combined_readiness() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut callbacks = noop_callbacks();
        {
            let order = order.clone();
            callbacks.read = Box::new(move |_| order.borrow_mut().push("read"));
        }
        {
            let order = order.clone();
            callbacks.write = Box::new(move || order.borrow_mut().push("write"));
        }
        let channel = Rc::new(RefCell::new(Channel::new(0, callbacks)));
        channel.borrow_mut().set_revents(Readiness {
            readable: true,
            writable: true,
            hup: false,
            error: false,
        });

        dispatch(&channel, Timestamp::now());
        assert_eq!(*order.borrow(), vec!["read", "write"]);
    }

    #[test]
    fn dispatch_on_hangup_without_readable_data_only_fires_close() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut callbacks = noop_callbacks();
        {
            let order = order.clone();
            callbacks.close = Box::new(move || order.borrow_mut().push("close"));
        }
        {
            let order = order.clone();
            callbacks.read = Box::new(move |_| order.borrow_mut().push("read"));
        }
        let channel = Rc::new(RefCell::new(Channel::new(0, callbacks)));
        channel.borrow_mut().set_revents(Readiness {
            readable: false,
            writable: false,
            hup: true,
            error: false,
        });

        dispatch(&channel, Timestamp::now());
        assert_eq!(*order.borrow(), vec!["close"]);
    }

    #[test]
    fn dispatch_skips_callbacks_once_tied_owner_is_dropped() {
        let fired = Rc::new(Cell::new(false));
        let mut callbacks = noop_callbacks();
        {
            let fired = fired.clone();
            callbacks.read = Box::new(move |_| fired.set(true));
        }
        let channel = Rc::new(RefCell::new(Channel::new(0, callbacks)));

        let owner_marker = Rc::new(());
        channel.borrow_mut().tie(&owner_marker);
        drop(owner_marker);

        channel.borrow_mut().set_revents(Readiness {
            readable: true,
            writable: false,
            hup: false,
            error: false,
        });
        dispatch(&channel, Timestamp::now());
        assert!(!fired.get());
    }
}
