use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::macros::fatal;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

struct Handoff {
    loop_handle: Mutex<Option<EventLoopHandle>>,
    ready: Condvar,
}

/// Owns a single background thread running exactly one [`EventLoop`] for
/// its entire lifetime.
///
/// Mirrors `EventLoopThread`'s condition-variable handshake: the
/// constructing thread blocks in [`LoopThread::start_loop`] until the new
/// thread has built its loop and is about to call [`EventLoop::run`], so
/// callers never race a handle against a loop that doesn't exist yet.
pub struct LoopThread {
    join: Option<JoinHandle<()>>,
    handoff: Arc<Handoff>,
}

impl LoopThread {
    pub fn new<F>(init: F) -> LoopThread
    where
        F: FnOnce(&Rc<EventLoop>) + Send + 'static,
    {
        let handoff = Arc::new(Handoff {
            loop_handle: Mutex::new(None),
            ready: Condvar::new(),
        });
        let handoff2 = handoff.clone();

        let join = std::thread::spawn(move || {
            let event_loop = match EventLoop::new() {
                Ok(l) => l,
                Err(e) => fatal!("LoopThread: failed to create EventLoop: {e}"),
            };
            init(&event_loop);

            {
                let mut guard = handoff2.loop_handle.lock().unwrap();
                *guard = Some(event_loop.handle());
                handoff2.ready.notify_one();
            }

            event_loop.run();
        });

        LoopThread {
            join: Some(join),
            handoff,
        }
    }

    /// Blocks until the spawned thread's loop exists, then returns a
    /// handle to it. Cheap to call more than once; later calls just
    /// return another clone of the same handle.
    pub fn start_loop(&self) -> EventLoopHandle {
        let mut guard = self.handoff.loop_handle.lock().unwrap();
        while guard.is_none() {
            guard = self.handoff.ready.wait(guard).unwrap();
        }
        guard.clone().unwrap()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handoff.loop_handle.lock().unwrap().clone() {
            handle.quit();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// A fixed-size pool of [`LoopThread`]s, handed out round-robin to spread
/// accepted connections across CPUs.
///
/// With zero threads configured, [`LoopThreadPool::next_loop`] always
/// returns the base loop's own handle — a `TcpServer` with no sub-loops
/// runs entirely on its accepting loop, same as the original's default.
pub struct LoopThreadPool {
    base_loop: Rc<EventLoop>,
    num_threads: Cell<usize>,
    started: Cell<bool>,
    threads: RefCell<Vec<LoopThread>>,
    handles: RefCell<Vec<EventLoopHandle>>,
    next: Cell<usize>,
}

impl LoopThreadPool {
    pub fn new(base_loop: Rc<EventLoop>) -> LoopThreadPool {
        LoopThreadPool {
            base_loop,
            num_threads: Cell::new(0),
            started: Cell::new(false),
            threads: RefCell::new(Vec::new()),
            handles: RefCell::new(Vec::new()),
            next: Cell::new(0),
        }
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.num_threads.set(num_threads);
    }

    /// Spawns `thread_num` [`LoopThread`]s, running `init` on each one's
    /// loop before it starts serving. Must be called at most once.
    pub fn start<F>(&self, init: F)
    where
        F: Fn(&Rc<EventLoop>) + Send + Clone + 'static,
    {
        assert!(!self.started.get(), "LoopThreadPool::start called twice");
        self.started.set(true);

        for _ in 0..self.num_threads.get() {
            let init = init.clone();
            let thread = LoopThread::new(move |loop_| init(loop_));
            let handle = thread.start_loop();
            self.handles.borrow_mut().push(handle);
            self.threads.borrow_mut().push(thread);
        }

        if self.num_threads.get() == 0 {
            init(&self.base_loop);
        }
    }

    /// Returns the next loop in round-robin order, or the base loop if no
    /// sub-loops were configured.
    pub fn next_loop(&self) -> EventLoopHandle {
        let handles = self.handles.borrow();
        if handles.is_empty() {
            return self.base_loop.handle();
        }
        let idx = self.next.get();
        let handle = handles[idx % handles.len()].clone();
        self.next.set((idx + 1) % handles.len());
        handle
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads.get()
    }
}
