//! Drives a single outbound connection to one server address, reconnecting
//! on request.
//!
//! Unlike [`crate::tcp_server::TcpServer`], a `TcpClient` never spans more
//! than one loop: the [`crate::connector::Connector`] it owns and the
//! [`Connection`] it produces both live on the same thread as the client
//! itself, so there is no cross-thread handoff here and the three
//! callbacks can simply be cloned in place before
//! [`Connection::establish`].

use crate::callbacks::{ConnectionCallback, MessageCallback, WriteCompleteCallback};
use crate::connection::Connection;
use crate::connector::Connector;
use crate::event_loop::EventLoop;
use crate::sys::socket;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;

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

/// Connects to one server address, reconnecting only after an
/// established connection later drops and [`TcpClient::enable_retry`]
/// was called — the [`Connector`]'s own retry on the *initial* attempt
/// is not wired up (see its doc comment).
pub struct TcpClient {
    self_weak: Weak<TcpClient>,
    loop_: Rc<EventLoop>,
    connector: Rc<Connector>,
    name: String,
    server_addr: SocketAddr,
    retry: Cell<bool>,
    connect: Cell<bool>,
    next_conn_id: Cell<i32>,
    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<WriteCompleteCallback>,
    connection: RefCell<Option<Rc<Connection>>>,
}

impl TcpClient {
    pub fn new(loop_: Rc<EventLoop>, server_addr: SocketAddr, name: impl Into<String>) -> Rc<TcpClient> {
        let name = name.into();
        let connector = Connector::new(loop_.clone(), server_addr);

        let client = Rc::new_cyclic(|weak_self| {
            let weak_for_new_conn = weak_self.clone();
            connector.set_new_connection_callback(move |fd| match weak_for_new_conn.upgrade() {
                Some(client) => client.new_connection(fd),
                None => {
                    let _ = unsafe { libc::close(fd) };
                }
            });

            TcpClient {
                self_weak: weak_self.clone(),
                loop_,
                connector,
                name,
                server_addr,
                retry: Cell::new(false),
                connect: Cell::new(false),
                next_conn_id: Cell::new(1),
                connection_callback: RefCell::new(default_connection_callback()),
                message_callback: RefCell::new(default_message_callback()),
                write_complete_callback: RefCell::new(Arc::new(|_: &Rc<Connection>| {})),
                connection: RefCell::new(None),
            }
        });

        client
    }

    fn rc(&self) -> Rc<TcpClient> {
        self.self_weak.upgrade().expect("TcpClient outlived its own Rc")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
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

    /// Reconnect after the established connection later drops. Distinct
    /// from the connector's own retry, which only covers the *initial*
    /// connect attempt and is always on.
    pub fn enable_retry(&self) {
        self.retry.set(true);
    }

    pub fn connect(&self) {
        log::info!(
            "TcpClient::connect [{}] - connecting to {}",
            self.name,
            self.server_addr
        );
        self.connect.set(true);
        self.connector.start();
    }

    /// Half-closes the current connection, if any; does not stop a
    /// connection attempt already in flight (see [`TcpClient::stop`]).
    pub fn disconnect(&self) {
        self.connect.set(false);
        if let Some(conn) = self.connection.borrow().clone() {
            conn.shutdown();
        }
    }

    /// Abandons a connection attempt still in flight. Has no effect on an
    /// already-established connection (use [`TcpClient::disconnect`]).
    pub fn stop(&self) {
        self.connect.set(false);
        self.connector.stop();
    }

    pub fn connection(&self) -> Option<Rc<Connection>> {
        self.connection.borrow().clone()
    }

    fn new_connection(&self, fd: RawFd) {
        self.loop_.assert_in_loop_thread();

        let peer_addr = match socket::peer_addr(fd) {
            Ok(addr) => addr,
            Err(e) => {
                log::error!("TcpClient::new_connection: getpeername failed: {e}");
                let _ = unsafe { libc::close(fd) };
                return;
            }
        };
        let local_addr = match socket::local_addr(fd) {
            Ok(addr) => addr,
            Err(e) => {
                log::error!("TcpClient::new_connection: getsockname failed: {e}");
                let _ = unsafe { libc::close(fd) };
                return;
            }
        };

        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let name = format!("{}:{}#{}", self.name, peer_addr, conn_id);

        let conn = match Connection::new(self.loop_.clone(), name, fd, local_addr, peer_addr) {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("TcpClient::new_connection: failed to construct connection: {e}");
                return;
            }
        };

        conn.set_connection_callback(self.connection_callback.borrow().clone());
        conn.set_message_callback(self.message_callback.borrow().clone());
        conn.set_write_complete_callback(self.write_complete_callback.borrow().clone());

        let this = self.rc();
        conn.set_close_callback(Rc::new(move |conn: &Rc<Connection>| {
            this.remove_connection(conn);
        }));

        *self.connection.borrow_mut() = Some(conn.clone());
        conn.establish();
    }

    fn remove_connection(&self, conn: &Rc<Connection>) {
        self.loop_.assert_in_loop_thread();

        *self.connection.borrow_mut() = None;

        let conn = conn.clone();
        self.loop_.queue_in_loop(move || conn.destroyed());

        if self.retry.get() && self.connect.get() {
            log::info!(
                "TcpClient::remove_connection [{}] - reconnecting to {}",
                self.name,
                self.server_addr
            );
            self.connector.start();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        log::info!("TcpClient::drop [{}]", self.name);
        match self.connection.borrow_mut().take() {
            Some(conn) => conn.force_close(),
            None => self.connector.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn connects_and_notifies_connection_callback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = listener.accept();
            std::thread::sleep(Duration::from_secs(2));
        });

        let (tx, rx) = mpsc::channel();
        let thread = std::thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let client = TcpClient::new(event_loop.clone(), server_addr, "test-client");
            let tx2 = tx.clone();
            client.set_connection_callback(Arc::new(move |conn| {
                let _ = tx2.send(conn.is_connected());
            }));
            client.connect();

            let handle = event_loop.handle();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(500));
                handle.quit();
            });
            event_loop.run();
        });

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        thread.join().unwrap();
    }
}
