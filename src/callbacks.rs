//! Shared callback type aliases.
//!
//! Channel-level callbacks ([`ReadCallback`]/[`EventCallback`]) are owned
//! exclusively by the one [`crate::channel::Channel`] they're registered on
//! and so are plain boxed closures.
//!
//! [`ConnectionCallback`], [`MessageCallback`] and [`WriteCompleteCallback`]
//! are set once on a [`crate::tcp_server::TcpServer`] or
//! [`crate::tcp_client::TcpClient`] and from there copied into every
//! [`crate::connection::Connection`] it creates — which, for a server with
//! sub-loops, means crossing from the accepting thread onto whichever
//! worker thread picked up the new connection. `Rc` can't make that trip
//! (its refcount isn't atomic), so these three are `Arc<dyn Fn + Send +
//! Sync>` instead: cheap to clone, and legal to move into the `Send`
//! closure that [`crate::event_loop::EventLoopHandle::queue_in_loop`]
//! requires. [`HighWaterMarkCallback`] and [`CloseCallback`] are set
//! directly on a `Connection` that already lives on its own loop's thread,
//! so they stay plain `Rc`, matching channel-level callbacks.
//!
//! [`ThreadInitCallback`] is handed to [`crate::loop_thread::LoopThreadPool::start`],
//! which clones it into the closure each spawned `std::thread::spawn` runs —
//! also `Send + Sync` for the same reason.

use crate::buffer::Buffer;
use crate::connection::Connection;
use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

pub type ReadCallback = Box<dyn FnMut(Timestamp)>;
pub type EventCallback = Box<dyn FnMut()>;

/// The four callbacks a [`crate::channel::Channel`] dispatches readiness
/// events to, in this fixed order: close (if hung up and not readable),
/// error, read, write.
pub struct ChannelCallbacks {
    pub read: ReadCallback,
    pub write: EventCallback,
    pub close: EventCallback,
    pub error: EventCallback,
}

pub fn noop_callbacks() -> ChannelCallbacks {
    ChannelCallbacks {
        read: Box::new(|_| {}),
        write: Box::new(|| {}),
        close: Box::new(|| {}),
        error: Box::new(|| {}),
    }
}

/// Fired once on connection establishment and once more just before
/// teardown; distinguish the two with [`Connection::is_connected`].
pub type ConnectionCallback = Arc<dyn Fn(&Rc<Connection>) + Send + Sync>;

/// Fired whenever bytes are read into the connection's input buffer. The
/// buffer is passed mutably so a framing decoder can retrieve only the
/// complete messages it finds and leave the remainder for the next call.
pub type MessageCallback = Arc<dyn Fn(&Rc<Connection>, &mut Buffer, Timestamp) + Send + Sync>;

/// Fired once the connection's output buffer has been fully drained to the
/// kernel after a `send` that could not complete immediately.
pub type WriteCompleteCallback = Arc<dyn Fn(&Rc<Connection>) + Send + Sync>;

/// Fired when queued-but-unsent output crosses a configured threshold,
/// giving the application a chance to apply backpressure upstream.
pub type HighWaterMarkCallback = Rc<dyn Fn(&Rc<Connection>, usize)>;

/// Fired exactly once per connection, right before it is removed from its
/// owning [`crate::tcp_server::TcpServer`] or [`crate::tcp_client::TcpClient`].
pub type CloseCallback = Rc<dyn Fn(&Rc<Connection>)>;

/// Fired by an [`crate::acceptor::Acceptor`] for every accepted connection,
/// handing ownership of the raw descriptor to the caller (typically
/// `TcpServer`, which wraps it in a `Connection` on a chosen sub-loop).
pub type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr)>;

/// Run once on each of a [`crate::loop_thread::LoopThreadPool`]'s sub-loops
/// right after it's constructed, before it starts serving connections —
/// e.g. to set thread-local state or adjust the new loop's priority.
pub type ThreadInitCallback = Arc<dyn Fn(&Rc<EventLoop>) + Send + Sync>;
