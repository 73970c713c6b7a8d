use crate::channel::{Channel, SharedChannel};
use crate::sys::selector::{Events, INITIAL_EVENTS_CAPACITY};
use crate::sys::Selector;
use crate::timestamp::Timestamp;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

/// A channel's relationship to the kernel's interest list, tracked on the
/// channel itself so the demultiplexer knows whether to `ADD`, `MOD`, or
/// `DEL` on the next [`Demultiplexer::update_channel`] call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegistrationState {
    /// Never registered with this demultiplexer.
    New,
    /// Registered and currently tracked.
    Added,
    /// Was registered, interest removed, entry kept in the channel map in
    /// case it is re-added shortly (avoids a map remove+reinsert churn).
    Deleted,
}

/// Owns one `epoll` instance and the set of channels registered with it.
///
/// Confined to the thread of the [`crate::event_loop::EventLoop`] that owns
/// it — never shared across threads.
pub struct Demultiplexer {
    selector: Selector,
    events: Events,
    channels: HashMap<RawFd, SharedChannel>,
}

impl Demultiplexer {
    pub fn new() -> io::Result<Demultiplexer> {
        Ok(Demultiplexer {
            selector: Selector::new()?,
            events: Events::with_capacity(INITIAL_EVENTS_CAPACITY),
            channels: HashMap::new(),
        })
    }

    /// Blocks up to `timeout_ms` waiting for I/O readiness, then fills
    /// `active` with every channel that became ready, stamping `poll_time`
    /// with the moment `epoll_wait` returned.
    pub fn poll(
        &mut self,
        timeout_ms: i32,
        active: &mut Vec<SharedChannel>,
    ) -> io::Result<Timestamp> {
        let n = self.selector.select(&mut self.events, timeout_ms)?;
        let poll_time = Timestamp::now();

        active.clear();
        for event in self.events.iter() {
            let fd = event.data as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.borrow_mut().set_revents(event.readiness);
                active.push(channel.clone());
            } else {
                log::warn!("demultiplexer: event for untracked fd {fd}");
            }
        }

        if self.events.is_full() {
            self.events.double_capacity();
        }

        let _ = n;
        Ok(poll_time)
    }

    /// Registers, updates, or deregisters a channel's interest depending on
    /// its current [`RegistrationState`] and whether it now has any
    /// interest at all.
    pub fn update_channel(&mut self, channel: &SharedChannel) -> io::Result<()> {
        let fd = channel.borrow().fd();
        let interest = channel.borrow().interest();
        let state = channel.borrow().registration_state();

        match state {
            RegistrationState::New | RegistrationState::Deleted => {
                if state == RegistrationState::New {
                    self.channels.insert(fd, channel.clone());
                }
                if !interest.is_none() {
                    self.selector.register(fd, fd as u64, interest)?;
                    channel
                        .borrow_mut()
                        .set_registration_state(RegistrationState::Added);
                }
            }
            RegistrationState::Added => {
                if interest.is_none() {
                    self.selector.deregister(fd);
                    channel
                        .borrow_mut()
                        .set_registration_state(RegistrationState::Deleted);
                } else {
                    self.selector.reregister(fd, fd as u64, interest)?;
                }
            }
        }
        Ok(())
    }

    /// Drops a channel from the interest list entirely. The channel must
    /// have no interest registered (callers disable it first).
    pub fn remove_channel(&mut self, channel: &SharedChannel) {
        let fd = channel.borrow().fd();
        let state = channel.borrow().registration_state();
        debug_assert!(channel.borrow().interest().is_none());

        if state == RegistrationState::Added {
            self.selector.deregister(fd);
        }
        self.channels.remove(&fd);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .map(|c| c.borrow().fd() == channel.fd())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::noop_callbacks;
    use std::rc::Rc;
    use std::cell::RefCell;

    #[test]
    fn new_channel_registers_on_first_update_with_interest() {
        let mut demux = Demultiplexer::new().unwrap();
        // fd 0 (stdin) is always open in a test process and safe to poll
        // for readability without side effects.
        let channel = Rc::new(RefCell::new(Channel::new(0, noop_callbacks())));
        channel.borrow_mut().enable_reading();
        demux.update_channel(&channel).unwrap();
        assert!(demux.has_channel(&channel.borrow()));
        assert_eq!(
            channel.borrow().registration_state(),
            RegistrationState::Added
        );
    }

    #[test]
    fn disabling_interest_then_removing_drops_the_channel() {
        let mut demux = Demultiplexer::new().unwrap();
        let channel = Rc::new(RefCell::new(Channel::new(0, noop_callbacks())));
        channel.borrow_mut().enable_reading();
        demux.update_channel(&channel).unwrap();

        channel.borrow_mut().disable_all();
        demux.update_channel(&channel).unwrap();
        assert_eq!(
            channel.borrow().registration_state(),
            RegistrationState::Deleted
        );

        demux.remove_channel(&channel);
        assert!(!demux.has_channel(&channel.borrow()));
    }
}
