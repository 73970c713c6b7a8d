use crate::buffer::Buffer;
use crate::callbacks::{CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback};
use crate::channel::{Channel, SharedChannel};
use crate::event_loop::EventLoop;
use crate::sys::socket;
use crate::timestamp::Timestamp;
use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Queued-but-unsent output above which [`Connection::set_high_water_mark_callback`]
/// fires. 64 MiB, matching the original's default.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Connecting,
    Connected,
    /// Write side shut down (or shutting down once the output buffer
    /// drains); still reading until the peer closes its side too.
    Disconnecting,
    Disconnected,
}

/// One established TCP connection: owns the socket, its read/write
/// buffers, and the four user-settable callbacks fired over its lifetime.
///
/// Confined to the [`EventLoop`] it was created on — `send`/`shutdown`
/// calls from other threads must be marshalled onto that loop first (see
/// [`crate::tcp_server::TcpServer`]/[`crate::tcp_client::TcpClient`], which
/// do this via [`crate::event_loop::EventLoopHandle::queue_in_loop`]).
pub struct Connection {
    self_weak: Weak<Connection>,
    loop_: Rc<EventLoop>,
    name: String,
    state: Cell<State>,
    channel: SharedChannel,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: RefCell<Buffer>,
    output_buffer: RefCell<Buffer>,
    high_water_mark: Cell<usize>,
    fd: RawFd,
    /// Keeps the channel's lifetime tie alive for as long as this
    /// connection exists; see [`Channel::tie`].
    close_marker: Rc<()>,

    connection_callback: RefCell<ConnectionCallback>,
    message_callback: RefCell<MessageCallback>,
    write_complete_callback: RefCell<WriteCompleteCallback>,
    high_water_mark_callback: RefCell<Option<HighWaterMarkCallback>>,
    close_callback: RefCell<Option<CloseCallback>>,
}

impl Connection {
    pub fn new(
        loop_: Rc<EventLoop>,
        name: String,
        fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> io::Result<Rc<Connection>> {
        socket::set_tcp_nodelay(fd, true)?;
        socket::set_keep_alive(fd, true)?;

        let channel = Rc::new(RefCell::new(Channel::with_noop_callbacks(fd)));
        let close_marker = Rc::new(());

        let connection = Rc::new_cyclic(|self_weak| Connection {
            self_weak: self_weak.clone(),
            loop_,
            name,
            state: Cell::new(State::Connecting),
            channel: channel.clone(),
            local_addr,
            peer_addr,
            input_buffer: RefCell::new(Buffer::new()),
            output_buffer: RefCell::new(Buffer::new()),
            high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
            fd,
            close_marker,
            connection_callback: RefCell::new(Arc::new(|_: &Rc<Connection>| {})),
            message_callback: RefCell::new(Arc::new(|_: &Rc<Connection>, _: &mut Buffer, _| {})),
            write_complete_callback: RefCell::new(Arc::new(|_: &Rc<Connection>| {})),
            high_water_mark_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
        });

        connection.wire_channel_callbacks();
        Ok(connection)
    }

    fn rc(&self) -> Rc<Connection> {
        self.self_weak
            .upgrade()
            .expect("Connection outlived its own Rc")
    }

    /// Wires the channel's four callbacks to weak upgrades of this
    /// connection, never a strong `Rc` clone: the channel is a field of
    /// `Connection` itself, so a strong capture here would tie
    /// `Connection -> channel -> callbacks -> Connection` into a cycle
    /// that never drops, leaking every connection and making
    /// [`Channel::tie`]'s protection moot (the tied marker would never go
    /// stale while the channel that outlives it keeps the owner alive).
    fn wire_channel_callbacks(&self) {
        {
            let this = self.self_weak.clone();
            self.channel.borrow_mut().set_read_callback(Box::new(move |time| {
                if let Some(this) = this.upgrade() {
                    this.handle_read(time);
                }
            }));
        }
        {
            let this = self.self_weak.clone();
            self.channel.borrow_mut().set_write_callback(Box::new(move || {
                if let Some(this) = this.upgrade() {
                    this.handle_write();
                }
            }));
        }
        {
            let this = self.self_weak.clone();
            self.channel.borrow_mut().set_close_callback(Box::new(move || {
                if let Some(this) = this.upgrade() {
                    this.handle_close();
                }
            }));
        }
        {
            let this = self.self_weak.clone();
            self.channel.borrow_mut().set_error_callback(Box::new(move || {
                if let Some(this) = this.upgrade() {
                    this.handle_error();
                }
            }));
        }
        self.channel.borrow_mut().tie(&self.close_marker);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() == State::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.get() == State::Disconnected
    }

    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.set(bytes);
    }

    /// Toggles Nagle's algorithm on the underlying socket. Enabled by
    /// default (see [`Connection::new`]); exposed so an application that
    /// prefers to coalesce small writes itself can turn it back off.
    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        socket::set_tcp_nodelay(self.fd, on)
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

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.high_water_mark_callback.borrow_mut() = Some(cb);
    }

    pub fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_callback.borrow_mut() = Some(cb);
    }

    /// Called once by the owner ([`crate::tcp_server::TcpServer`]/
    /// [`crate::tcp_client::TcpClient`]) right after all callbacks are
    /// wired, to start reading and fire the initial connection callback.
    pub fn establish(&self) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state.get(), State::Connecting);
        self.state.set(State::Connected);
        self.channel.borrow_mut().enable_reading();
        let _ = self.loop_.update_channel(&self.channel);
        (self.connection_callback.borrow())(&self.rc());
    }

    /// Tears down bookkeeping once the connection is fully gone: disables
    /// the channel and removes it from the loop. Called once, either from
    /// `handle_close` or directly by the owner on forced teardown.
    pub fn destroyed(&self) {
        if self.state.get() == State::Connected {
            self.state.set(State::Disconnected);
            self.channel.borrow_mut().disable_all();
        }
        self.loop_.remove_channel(&self.channel);
    }

    /// Queues `data` for sending, writing directly to the socket first if
    /// the output buffer is currently empty and the channel isn't already
    /// mid-write. Falls back to appending to the output buffer (enabling
    /// writability interest) for whatever doesn't fit.
    pub fn send(&self, data: &[u8]) {
        if self.state.get() != State::Connected {
            log::warn!("Connection::send: connection {} not connected", self.name);
            return;
        }

        let mut wrote = 0usize;
        let mut fault = false;

        if !self.channel.borrow().is_writing() && self.output_buffer.borrow().readable() == 0 {
            match socket::write_to_fd_direct(self.fd, data) {
                Ok(n) => {
                    wrote = n;
                    if wrote == data.len() {
                        let cb = self.write_complete_callback.borrow().clone();
                        let this = self.rc();
                        self.loop_.queue_in_loop(move || cb(&this));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::error!("Connection::send: write failed on {}: {e}", self.name);
                    if e.raw_os_error() == Some(libc::EPIPE)
                        || e.raw_os_error() == Some(libc::ECONNRESET)
                    {
                        fault = true;
                    }
                }
            }
        }

        if !fault && wrote < data.len() {
            let remaining = &data[wrote..];
            let new_len = {
                let mut out = self.output_buffer.borrow_mut();
                out.append(remaining);
                out.readable()
            };

            let hwm = self.high_water_mark.get();
            let before = new_len - remaining.len();
            if new_len >= hwm && before < hwm {
                if let Some(cb) = self.high_water_mark_callback.borrow().clone() {
                    let this = self.rc();
                    self.loop_.queue_in_loop(move || cb(&this, new_len));
                }
            }

            if !self.channel.borrow().is_writing() {
                self.channel.borrow_mut().enable_writing();
                let _ = self.loop_.update_channel(&self.channel);
            }
        }
    }

    /// Half-closes the connection: once the output buffer drains, shuts
    /// down the write side but keeps reading until the peer closes too.
    pub fn shutdown(&self) {
        if self.state.get() != State::Connected {
            return;
        }
        self.state.set(State::Disconnecting);
        if !self.channel.borrow().is_writing() {
            let _ = socket::shutdown_write(self.fd);
        }
    }

    /// Closes immediately regardless of buffered output, by simulating a
    /// hangup through the normal `handle_close` path.
    pub fn force_close(&self) {
        if matches!(self.state.get(), State::Connected | State::Disconnecting) {
            self.state.set(State::Disconnecting);
            let this = self.rc();
            self.loop_.run_in_loop(move || this.handle_close());
        }
    }

    fn handle_read(&self, time: Timestamp) {
        let result = self.input_buffer.borrow_mut().read_from_fd(self.fd);
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                let cb = self.message_callback.borrow().clone();
                let this = self.rc();
                let mut input = self.input_buffer.borrow_mut();
                cb(&this, &mut input, time);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("Connection::handle_read on {}: {e}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        if !self.channel.borrow().is_writing() {
            log::trace!("Connection {} not writing, skip handle_write", self.name);
            return;
        }
        let result = {
            let out = self.output_buffer.borrow();
            socket::write_to_fd_direct(self.fd, out.peek())
        };
        match result {
            Ok(n) => {
                self.output_buffer.borrow_mut().retrieve(n);
                if self.output_buffer.borrow().readable() == 0 {
                    self.channel.borrow_mut().disable_writing();
                    let _ = self.loop_.update_channel(&self.channel);

                    let cb = self.write_complete_callback.borrow().clone();
                    let this = self.rc();
                    self.loop_.queue_in_loop(move || cb(&this));

                    if self.state.get() == State::Disconnecting {
                        let _ = socket::shutdown_write(self.fd);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::error!("Connection::handle_write on {}: {e}", self.name),
        }
    }

    fn handle_close(&self) {
        if self.state.get() == State::Disconnected {
            return;
        }
        self.state.set(State::Disconnected);
        self.channel.borrow_mut().disable_all();

        let this = self.rc();
        (self.connection_callback.borrow())(&this);
        if let Some(cb) = self.close_callback.borrow().clone() {
            cb(&this);
        }
    }

    fn handle_error(&self) {
        match socket::take_socket_error(self.fd) {
            Ok(()) => {}
            Err(e) => log::error!("Connection::handle_error on {}: {e}", self.name),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_mark_defaults_to_64mib() {
        assert_eq!(DEFAULT_HIGH_WATER_MARK, 64 * 1024 * 1024);
    }
}
