use crate::channel::{self, Channel, SharedChannel};
use crate::macros::fatal;
use crate::poller::Demultiplexer;
use crate::sys::Waker;
use crate::timestamp::Timestamp;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

thread_local! {
    /// The loop owned by this thread, if any. Lets code that only has
    /// `Send` data in hand (e.g. a task a [`crate::tcp_server::TcpServer`]
    /// queued onto one of its sub-loops) recover the `Rc<EventLoop>` once
    /// it's actually executing there, without ever sending the `Rc` itself
    /// across a thread boundary.
    static CURRENT_LOOP: RefCell<Option<Weak<EventLoop>>> = RefCell::new(None);
}

/// `epoll_wait` timeout used when nothing else bounds it. The original's
/// 10-second value is kept verbatim: it only matters for how promptly a
/// loop with no channels and no pending tasks notices a `quit()` called
/// from its own thread's signal handler; cross-thread `quit()` always
/// wakes the loop immediately via the wakeup descriptor.
const POLL_TIMEOUT_MS: i32 = 10_000;

type PendingTask = Box<dyn FnOnce() + Send>;

/// The part of an `EventLoop` that must be reachable from other threads:
/// the pending-task queue other threads submit into, and the wakeup
/// descriptor that interrupts this loop's blocked `epoll_wait` once a task
/// (or a cross-thread `quit()`) needs prompt attention.
struct LoopShared {
    thread_id: ThreadId,
    pending: Mutex<Vec<PendingTask>>,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    waker: Waker,
}

/// A `Send + Sync` handle to an [`EventLoop`] that can be held by other
/// threads, e.g. by a [`crate::tcp_server::TcpServer`] routing a freshly
/// accepted connection onto one of its sub-loops.
///
/// The loop itself (`EventLoop`) is confined to the thread that calls
/// [`EventLoop::run`] — it is neither `Send` nor `Sync`, since its
/// descriptor table and active-channel list are only ever touched from
/// that one thread. `EventLoopHandle` is the `Arc`-backed escape hatch:
/// everything reachable through it is either behind a `Mutex` or otherwise
/// safe to touch from any thread.
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<LoopShared>,
}

impl EventLoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.shared.thread_id
    }

    /// Queues `task` for execution on the loop's own thread, waking the
    /// loop if it might currently be blocked in `epoll_wait`.
    ///
    /// Unlike [`EventLoop::run_in_loop`], this always queues even when
    /// called from the loop's own thread: a handle has no access to the
    /// loop's internals, only to the `Send` surface behind the `Mutex`, so
    /// there is no way to execute `task` immediately without going through
    /// the queue. The cost is one extra queue round-trip on the rare case
    /// of a same-thread call through a handle; correctness is unaffected.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.pending.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::SeqCst) {
            if let Err(e) = self.shared.waker.wake() {
                log::warn!("EventLoopHandle::queue_in_loop: wake failed: {e}");
            }
        }
    }

    /// Requests that the loop stop running after its current iteration.
    /// Safe to call from any thread.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            if let Err(e) = self.shared.waker.wake() {
                log::warn!("EventLoopHandle::quit: wake failed: {e}");
            }
        }
    }
}

/// One reactor: a demultiplexer, the channels registered with it, and a
/// queue of tasks other threads have asked to run here.
///
/// Not `Send`/`Sync` — own it with an `Rc` within the thread that drives
/// it, and hand out [`EventLoopHandle`]s (via [`EventLoop::handle`]) to
/// anything that needs to reach this loop from elsewhere.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    demux: RefCell<Demultiplexer>,
    active_channels: RefCell<Vec<SharedChannel>>,
    wakeup_channel: SharedChannel,
    looping: Cell<bool>,
    event_handling: Cell<bool>,
    /// Same-thread deferred calls, distinct from `shared.pending`: these
    /// don't need `Send` since they never leave this thread, only the
    /// current call stack — used to break reentrancy (e.g. a
    /// write-complete callback fired from inside `Connection::send`).
    local_pending: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl EventLoop {
    pub fn new() -> io::Result<Rc<EventLoop>> {
        let waker = Waker::new()?;
        let shared = Arc::new(LoopShared {
            thread_id: std::thread::current().id(),
            pending: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            waker,
        });

        let wakeup_fd = shared.waker.as_raw_fd();
        let wakeup_channel = Rc::new(RefCell::new(Channel::with_noop_callbacks(wakeup_fd)));

        let event_loop = Rc::new(EventLoop {
            shared,
            demux: RefCell::new(Demultiplexer::new()?),
            active_channels: RefCell::new(Vec::new()),
            wakeup_channel: wakeup_channel.clone(),
            looping: Cell::new(false),
            event_handling: Cell::new(false),
            local_pending: RefCell::new(Vec::new()),
        });

        {
            let weak_loop = Rc::downgrade(&event_loop);
            wakeup_channel.borrow_mut().set_read_callback(Box::new(move |_| {
                if let Some(event_loop) = weak_loop.upgrade() {
                    event_loop.handle_wakeup();
                }
            }));
            wakeup_channel.borrow_mut().enable_reading();
        }
        event_loop.demux.borrow_mut().update_channel(&wakeup_channel)?;

        CURRENT_LOOP.with(|cell| {
            let mut current = cell.borrow_mut();
            if current.as_ref().and_then(Weak::upgrade).is_some() {
                fatal!("EventLoop::new: this thread already owns an EventLoop");
            }
            *current = Some(Rc::downgrade(&event_loop));
        });

        Ok(event_loop)
    }

    /// Returns the loop owned by the calling thread, if it is currently
    /// running one. `None` on any thread that hasn't called
    /// [`EventLoop::new`], or whose loop has since been dropped.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.shared.thread_id
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            fatal!(
                "EventLoop used from a thread other than the one that created it: {:?} != {:?}",
                std::thread::current().id(),
                self.shared.thread_id
            );
        }
    }

    fn handle_wakeup(&self) {
        if let Err(e) = self.shared.waker.reset() {
            log::warn!("EventLoop::handle_wakeup: reset failed: {e}");
        }
    }

    /// Runs `task` immediately. Callers on other threads cannot obtain a
    /// `&EventLoop` at all (it is neither `Send` nor `Sync`) and must go
    /// through [`EventLoopHandle::queue_in_loop`] instead.
    pub fn run_in_loop(&self, task: impl FnOnce() + 'static) {
        self.assert_in_loop_thread();
        task();
    }

    /// Defers `task` to run on this loop's thread after the current
    /// dispatch pass finishes, breaking reentrancy for callbacks that
    /// shouldn't fire from inside the call that triggered them (mirrors
    /// the original's `queueInLoop`, minus the cross-thread case, which
    /// goes through [`EventLoopHandle::queue_in_loop`] instead).
    pub fn queue_in_loop(&self, task: impl FnOnce() + 'static) {
        self.assert_in_loop_thread();
        self.local_pending.borrow_mut().push(Box::new(task));
    }

    /// Registers or updates `channel`'s interest with this loop's
    /// demultiplexer. Must be called from this loop's own thread.
    pub fn update_channel(&self, channel: &SharedChannel) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.demux.borrow_mut().update_channel(channel)
    }

    /// Drops `channel` from this loop's demultiplexer entirely. Must be
    /// called from this loop's own thread, after disabling all interest.
    pub fn remove_channel(&self, channel: &SharedChannel) {
        self.assert_in_loop_thread();
        self.demux.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.demux.borrow().has_channel(channel)
    }

    pub fn quit(&self) {
        self.handle().quit();
    }

    /// Runs the reactor until [`EventLoopHandle::quit`] (or
    /// [`EventLoop::quit`]) is called. Must be called from the thread that
    /// constructed this loop, and only once.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.looping.get(), "EventLoop::run called re-entrantly");
        self.looping.set(true);
        self.shared.quit.store(false, Ordering::SeqCst);

        log::trace!("EventLoop {:?} started", self.shared.thread_id);

        while !self.shared.quit.load(Ordering::SeqCst) {
            let mut active = self.active_channels.borrow_mut();
            let poll_time = match self.demux.borrow_mut().poll(POLL_TIMEOUT_MS, &mut active) {
                Ok(t) => t,
                Err(e) => {
                    log::error!("EventLoop::run: poll failed: {e}");
                    Timestamp::now()
                }
            };

            self.event_handling.set(true);
            for ch in active.iter() {
                channel::dispatch(ch, poll_time);
            }
            drop(active);
            self.event_handling.set(false);

            self.do_pending_tasks();
            self.do_local_pending();
        }

        log::trace!("EventLoop {:?} stopping", self.shared.thread_id);
        self.looping.set(false);
    }

    fn do_pending_tasks(&self) {
        self.shared.calling_pending.store(true, Ordering::SeqCst);

        let tasks = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }

        self.shared.calling_pending.store(false, Ordering::SeqCst);
    }

    fn do_local_pending(&self) {
        let tasks = std::mem::take(&mut *self.local_pending.borrow_mut());
        for task in tasks {
            task();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;
    use std::rc::Rc as StdRc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn run_in_loop_from_owning_thread_executes_immediately() {
        let event_loop = EventLoop::new().unwrap();
        let ran = StdRc::new(StdCell::new(false));
        let ran2 = ran.clone();
        event_loop.run_in_loop(move || ran2.set(true));
        assert!(ran.get());
    }

    #[test]
    fn cross_thread_quit_stops_a_blocked_run() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let handle2 = handle.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            counter2.fetch_add(1, Ordering::SeqCst);
            handle2.quit();
        });

        let started = std::time::Instant::now();
        event_loop.run();
        worker.join().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn current_returns_this_threads_loop_once_constructed() {
        assert!(EventLoop::current().is_none());
        let event_loop = EventLoop::new().unwrap();
        let current = EventLoop::current().expect("current loop should be set");
        assert!(StdRc::ptr_eq(
            &current,
            &event_loop
        ));
    }

    #[test]
    fn queue_in_loop_runs_on_next_iteration_not_immediately() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let handle2 = handle.clone();

        handle.queue_in_loop(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            handle2.quit();
        });

        event_loop.run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
