//! spec.md §8 scenario 2: length-prefixed framing. A sender writes two
//! messages, each preceded by a 32-bit big-endian length, concatenated
//! into a single TCP write; the receiver's message callback must still
//! observe them as two distinct, complete messages, exercising the
//! buffer's partial-frame handling.

mod util;

use netloop::{EventLoop, TcpServer};
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[test]
fn length_prefixed_framing_splits_one_write_into_two_messages() {
    util::init();

    let (addr_tx, addr_rx) = mpsc::channel();
    let (msg_tx, msg_rx) = mpsc::channel::<Vec<u8>>();

    let server_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "framing-server", false).unwrap();

        server.set_message_callback(Arc::new(move |_conn, buf, _time| loop {
            if buf.readable() < 4 {
                break;
            }
            let len = buf.peek_i32() as usize;
            if buf.readable() < 4 + len {
                break;
            }
            buf.retrieve(4);
            let payload = buf.retrieve_as_vec(len);
            let _ = msg_tx.send(payload);
        }));
        server.start();

        let bound = server.local_addr().unwrap();
        addr_tx.send((bound, event_loop.handle())).unwrap();
        event_loop.run();
    });

    let (bound, handle) = addr_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let mut stream = TcpStream::connect(bound).unwrap();
    let mut combined = frame(b"ab");
    combined.extend_from_slice(&frame(b"cdef"));
    stream.write_all(&combined).unwrap();

    let first = msg_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = msg_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first, b"ab");
    assert_eq!(second, b"cdef");

    drop(stream);
    handle.quit();
    server_thread.join().unwrap();
}
