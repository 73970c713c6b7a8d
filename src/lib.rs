//! netloop: a non-blocking, multi-reactor TCP networking library.
//!
//! An [`EventLoop`] is a single-threaded epoll reactor; a
//! [`loop_thread::LoopThreadPool`] runs several of them on dedicated
//! threads. [`TcpServer`] accepts connections on one loop and spreads them
//! round-robin across such a pool; [`TcpClient`] drives a single outbound
//! connection on one loop. Both hand every accepted or connected socket to
//! a [`Connection`], which owns the socket's read/write buffering and
//! fires the four callbacks an application cares about: connection
//! up/down, message arrival, write completion, and (optionally) crossing
//! a high-water mark of queued-but-unsent output.
//!
//! Every `EventLoop` is confined to the thread that calls [`EventLoop::run`]
//! on it; reaching it from elsewhere goes through the `Send + Sync`
//! [`EventLoopHandle`]. See the module docs on [`tcp_server`] for how
//! connections cross that boundary during dispatch.

pub mod acceptor;
pub mod buffer;
pub mod callbacks;
pub mod channel;
pub mod connection;
pub mod connector;
pub mod event_loop;
pub mod interest;
pub mod loop_thread;
pub mod poller;
pub mod tcp_client;
pub mod tcp_server;
pub mod timestamp;

mod macros;
mod sys;

pub use buffer::Buffer;
pub use callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    NewConnectionCallback, ThreadInitCallback, WriteCompleteCallback,
};
pub use connection::Connection;
pub use connector::Connector;
pub use event_loop::{EventLoop, EventLoopHandle};
pub use loop_thread::{LoopThread, LoopThreadPool};
pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;
pub use timestamp::Timestamp;
