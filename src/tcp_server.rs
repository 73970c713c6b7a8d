//! Accepts connections on one loop and fans them out across a
//! [`LoopThreadPool`] of sub-loops.
//!
//! The acceptor, the sub-loop pool, and the name→loop-handle bookkeeping
//! all live on the loop that constructed this server (the "base loop").
//! Each accepted connection, however, is *constructed* on whichever
//! sub-loop picked it up — its [`Connection`] is an `Rc`-rooted,
//! thread-confined value that never leaves that thread. The only things
//! that cross the accepting thread → sub-loop thread boundary are `Send`
//! primitives (the raw fd, the two addresses, the connection's name) and
//! the three `Arc`-based user callbacks; see [`crate::callbacks`].
//!
//! Tearing a connection back down crosses threads the other way: its
//! close callback (built fresh on the sub-loop thread, so it never itself
//! needs to be `Send`) marshals the name back onto the base loop to erase
//! it from the bookkeeping map, then marshals back onto the sub-loop to
//! actually run [`Connection::destroyed`] — mirroring the original's
//! `removeConnection` → `removeConnectionInLoop` → `queueInLoop` chain.
//!
//! A `Connection` can't be looked up by name from the base thread (that
//! would require sending an `Rc` across threads), so each sub-loop thread
//! keeps its own [`WORKER_CONNECTIONS`] registry of the connections it
//! owns, and the base thread's [`TcpServer::connections`] map stores just
//! enough to route a removal: which sub-loop owns which name. Finding a
//! `TcpServer` itself from inside a queued base-loop task has the same
//! problem one level up — solved the same way, via [`SERVER_REGISTRY`].

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, ThreadInitCallback, WriteCompleteCallback,
};
use crate::connection::Connection;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::loop_thread::LoopThreadPool;
use crate::sys::socket;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

thread_local! {
    static SERVER_REGISTRY: RefCell<HashMap<u64, Weak<TcpServer>>> = RefCell::new(HashMap::new());
    static WORKER_CONNECTIONS: RefCell<HashMap<String, Rc<Connection>>> = RefCell::new(HashMap::new());
}

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

fn default_connection_callback() -> ConnectionCallback {
    Arc::new(|conn: &Rc<Connection>| {
        log::info!(
            "{} -> {} is {}",
            conn.local_addr(),
            conn.peer_addr(),
            if conn.is_connected() { "UP" } else { "DOWN" }
        );
    })
}

fn default_message_callback() -> MessageCallback {
    Arc::new(|_conn, buf, _time| {
        buf.retrieve_all();
    })
}

/// Listens on one address and dispatches every accepted connection across
/// a pool of sub-loops, round-robin.
///
/// With no sub-loops configured ([`TcpServer::set_thread_num`] never
/// called, or called with `0`), every connection is handled on the same
/// loop that accepts it.
pub struct TcpServer {
    id: u64,
    loop_: Rc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Rc<Acceptor>,
    pool: Rc<LoopThreadPool>,
    started: AtomicBool,
    next_conn_id: Cell<i32>,
    /// name -> handle of the sub-loop that owns that connection. The
    /// connection object itself lives in that sub-loop thread's
    /// [`WORKER_CONNECTIONS`], not here — see the module docs.
    connections: RefCell<HashMap<String, EventLoopHandle>>,
    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<WriteCompleteCallback>,
    thread_init_callback: RefCell<Option<ThreadInitCallback>>,
}

impl TcpServer {
    /// Binds `addr` on `loop_` (which becomes this server's base/accepting
    /// loop) but does not start listening — call [`TcpServer::start`] for
    /// that, after wiring up callbacks and (optionally)
    /// [`TcpServer::set_thread_num`].
    pub fn new(
        loop_: Rc<EventLoop>,
        addr: SocketAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<Rc<TcpServer>> {
        let name = name.into();
        let ip_port = addr.to_string();
        let acceptor = Acceptor::new(loop_.clone(), &addr, reuse_port)?;
        let pool = Rc::new(LoopThreadPool::new(loop_.clone()));
        let id = NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed);

        let server = Rc::new_cyclic(|weak_self| {
            let weak_for_accept = weak_self.clone();
            acceptor.set_new_connection_callback(Box::new(move |fd, peer_addr| {
                match weak_for_accept.upgrade() {
                    Some(server) => server.new_connection(fd, peer_addr),
                    None => {
                        let _ = unsafe { libc::close(fd) };
                    }
                }
            }));

            TcpServer {
                id,
                loop_,
                name,
                ip_port,
                acceptor,
                pool,
                started: AtomicBool::new(false),
                next_conn_id: Cell::new(1),
                connections: RefCell::new(HashMap::new()),
                connection_callback: RefCell::new(default_connection_callback()),
                message_callback: RefCell::new(default_message_callback()),
                write_complete_callback: RefCell::new(Arc::new(|_: &Rc<Connection>| {})),
                thread_init_callback: RefCell::new(None),
            }
        });

        SERVER_REGISTRY.with(|registry| {
            registry.borrow_mut().insert(id, Rc::downgrade(&server));
        });

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The address the acceptor actually bound to — useful when `addr`'s
    /// port was `0` and the kernel picked one.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        socket::local_addr(self.acceptor.as_raw_fd())
    }

    /// Sets how many sub-loops to spread accepted connections across.
    /// Takes effect at the next [`TcpServer::start`]; has no effect once
    /// already started.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.thread_init_callback.borrow_mut() = Some(cb);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.borrow_mut() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.borrow_mut() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.borrow_mut() = cb;
    }

    /// Starts the sub-loop pool and begins listening. Idempotent: calling
    /// this more than once past the first time is a no-op, matching the
    /// original's atomic `started_++ == 0` guard.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let init_cb = self.thread_init_callback.borrow().clone();
        self.pool.start(move |loop_: &Rc<EventLoop>| {
            if let Some(cb) = &init_cb {
                cb(loop_);
            }
        });

        let acceptor = self.acceptor.clone();
        self.loop_.run_in_loop(move || {
            if let Err(e) = acceptor.listen() {
                log::error!("TcpServer::start: acceptor.listen failed: {e}");
            }
        });
    }

    fn new_connection(&self, fd: RawFd, peer_addr: SocketAddr) {
        self.loop_.assert_in_loop_thread();

        let worker_handle = self.pool.next_loop();
        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        let local_addr = match socket::local_addr(fd) {
            Ok(addr) => addr,
            Err(e) => {
                log::error!("TcpServer::new_connection: getsockname failed: {e}");
                let _ = unsafe { libc::close(fd) };
                return;
            }
        };

        log::info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name,
            name,
            peer_addr
        );

        self.connections
            .borrow_mut()
            .insert(name.clone(), worker_handle.clone());

        let conn_cb = self.connection_callback.borrow().clone();
        let msg_cb = self.message_callback.borrow().clone();
        let wc_cb = self.write_complete_callback.borrow().clone();
        let base_handle = self.loop_.handle();
        let server_id = self.id;

        worker_handle.queue_in_loop(move || {
            finish_new_connection(
                server_id, name, fd, local_addr, peer_addr, conn_cb, msg_cb, wc_cb, base_handle,
            );
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        SERVER_REGISTRY.with(|registry| {
            registry.borrow_mut().remove(&self.id);
        });
        for (name, handle) in self.connections.borrow_mut().drain() {
            handle.queue_in_loop(move || destroy_connection_in_loop(&name));
        }
    }
}

/// Runs on the sub-loop thread that `worker_handle`'s `queue_in_loop`
/// landed on: constructs the [`Connection`], wires the callbacks handed
/// down from the server, and establishes it.
fn finish_new_connection(
    server_id: u64,
    name: String,
    fd: RawFd,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    conn_cb: ConnectionCallback,
    msg_cb: MessageCallback,
    wc_cb: WriteCompleteCallback,
    base_handle: EventLoopHandle,
) {
    let worker_loop = match EventLoop::current() {
        Some(loop_) => loop_,
        None => {
            log::error!(
                "TcpServer: connection {name} dispatched to a thread with no EventLoop"
            );
            let _ = unsafe { libc::close(fd) };
            return;
        }
    };

    let conn = match Connection::new(worker_loop, name.clone(), fd, local_addr, peer_addr) {
        Ok(conn) => conn,
        Err(e) => {
            log::error!("TcpServer: failed to construct connection {name}: {e}");
            return;
        }
    };

    conn.set_connection_callback(conn_cb);
    conn.set_message_callback(msg_cb);
    conn.set_write_complete_callback(wc_cb);

    let name_for_close = name.clone();
    conn.set_close_callback(Rc::new(move |_conn: &Rc<Connection>| {
        let name = name_for_close.clone();
        base_handle.queue_in_loop(move || remove_connection_in_loop(server_id, &name));
    }));

    WORKER_CONNECTIONS.with(|connections| {
        connections.borrow_mut().insert(name, conn.clone());
    });

    conn.establish();
}

/// Runs on the base loop thread: erases `name` from the server's
/// bookkeeping map and, if found, marshals the actual teardown back onto
/// the sub-loop that owns it.
fn remove_connection_in_loop(server_id: u64, name: &str) {
    let server = SERVER_REGISTRY.with(|registry| {
        registry.borrow().get(&server_id).and_then(Weak::upgrade)
    });

    let Some(server) = server else {
        return;
    };
    log::info!(
        "TcpServer::remove_connection_in_loop [{}] - connection {}",
        server.name,
        name
    );

    if let Some(owner) = server.connections.borrow_mut().remove(name) {
        let name = name.to_string();
        owner.queue_in_loop(move || destroy_connection_in_loop(&name));
    }
}

/// Runs on the sub-loop thread that actually owns the named connection:
/// drops this module's last strong reference to it after calling
/// [`Connection::destroyed`].
fn destroy_connection_in_loop(name: &str) {
    let conn = WORKER_CONNECTIONS.with(|connections| connections.borrow_mut().remove(name));
    if let Some(conn) = conn {
        conn.destroyed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn binds_without_listening_until_start() {
        let event_loop = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(event_loop, addr, "test", false).unwrap();
        assert!(!server.acceptor.listening());
        assert!(server.local_addr().unwrap().port() != 0);
    }

    #[test]
    fn start_is_idempotent() {
        let event_loop = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "test", false).unwrap();
        server.start();
        server.start();
        event_loop.run_in_loop(|| {});
        assert!(server.acceptor.listening());
    }

    #[test]
    fn accepts_a_connection_and_notifies_connection_callback() {
        let (addr_tx, addr_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel::<bool>();

        let thread = std::thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
            let server = TcpServer::new(event_loop.clone(), addr, "test", false).unwrap();

            server.set_connection_callback(Arc::new(move |conn| {
                let _ = event_tx.send(conn.is_connected());
            }));
            server.start();

            let bound = server.local_addr().unwrap();
            addr_tx.send((bound, event_loop.handle())).unwrap();
            event_loop.run();
        });

        let (bound, handle) = addr_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let stream = std::net::TcpStream::connect(bound).unwrap();
        assert!(event_rx.recv_timeout(Duration::from_secs(2)).unwrap());
        drop(stream);
        assert!(!event_rx.recv_timeout(Duration::from_secs(2)).unwrap());

        handle.quit();
        thread.join().unwrap();
    }
}
