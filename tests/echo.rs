//! spec.md §8 scenario 1: echo round-trip. A server whose message
//! callback echoes every message back; a single client sends one
//! message and expects to read back exactly that message, with the
//! connection callback firing exactly twice on each side (up, down).

mod util;

use netloop::{EventLoop, TcpServer};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn echo_round_trip() {
    util::init();

    let (addr_tx, addr_rx) = mpsc::channel();
    let (state_tx, state_rx) = mpsc::channel::<bool>();

    let server_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "echo-server", false).unwrap();

        server.set_connection_callback(Arc::new(move |conn| {
            let _ = state_tx.send(conn.is_connected());
        }));
        server.set_message_callback(Arc::new(|conn, buf, _time| {
            let bytes = buf.retrieve_all_as_vec();
            conn.send(&bytes);
        }));
        server.start();

        let bound = server.local_addr().unwrap();
        addr_tx.send((bound, event_loop.handle())).unwrap();
        event_loop.run();
    });

    let (bound, handle) = addr_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let mut stream = TcpStream::connect(bound).unwrap();
    assert!(state_rx.recv_timeout(Duration::from_secs(2)).unwrap(), "expected connection-up first");

    stream.write_all(b"hello").unwrap();
    let mut response = [0u8; 5];
    stream.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"hello");

    stream.shutdown(std::net::Shutdown::Both).unwrap();
    drop(stream);

    assert!(
        !state_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        "expected connection-down after the peer closed"
    );

    handle.quit();
    server_thread.join().unwrap();
}
