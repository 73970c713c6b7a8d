//! spec.md §8 scenario 5: half-close drains first. Queuing a large
//! payload and immediately calling `shutdown()` must still deliver every
//! byte to the peer before the write half actually closes.

mod util;

use netloop::{EventLoop, TcpServer};
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

const PAYLOAD_LEN: usize = 10 * 1024 * 1024;

#[test]
fn shutdown_after_queuing_output_drains_fully_before_eof() {
    util::init();

    let (addr_tx, addr_rx) = mpsc::channel();

    let server_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "half-close-server", false).unwrap();

        server.set_connection_callback(Arc::new(move |conn| {
            if !conn.is_connected() {
                return;
            }
            conn.send(&vec![9u8; PAYLOAD_LEN]);
            conn.shutdown();
        }));
        server.start();

        let bound = server.local_addr().unwrap();
        addr_tx.send((bound, event_loop.handle())).unwrap();
        event_loop.run();
    });

    let (bound, handle) = addr_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let mut stream = TcpStream::connect(bound).unwrap();

    let mut total = 0usize;
    let mut buf = [0u8; 65536];
    loop {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        total += n;
    }
    assert_eq!(total, PAYLOAD_LEN);

    drop(stream);
    handle.quit();
    server_thread.join().unwrap();
}
