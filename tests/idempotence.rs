//! spec.md §8 round-trip and idempotence laws: calling `shutdown()`
//! twice on a connection behaves the same as calling it once.

mod util;

use netloop::{EventLoop, TcpServer};
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn shutdown_called_twice_is_equivalent_to_once() {
    util::init();

    let (addr_tx, addr_rx) = mpsc::channel();

    let server_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "idempotence-server", false).unwrap();

        server.set_connection_callback(Arc::new(move |conn| {
            if !conn.is_connected() {
                return;
            }
            conn.shutdown();
            conn.shutdown();
        }));
        server.start();

        let bound = server.local_addr().unwrap();
        addr_tx.send((bound, event_loop.handle())).unwrap();
        event_loop.run();
    });

    let (bound, handle) = addr_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let mut stream = TcpStream::connect(bound).unwrap();

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected a clean EOF after a double shutdown()");

    drop(stream);
    handle.quit();
    server_thread.join().unwrap();
}
