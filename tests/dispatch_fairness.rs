//! spec.md §8 scenario 3: dispatch fairness. A server with two worker
//! loops accepting five connections in sequence must spread them
//! round-robin: the owning loop pattern is [W0, W1, W0, W1, W0].
//!
//! There's no public handle naming a worker loop, so this observes the
//! *thread* each connection's connection-up callback actually runs on —
//! which sub-loop owns a connection is exactly the thread that runs its
//! callbacks, per the one-loop-per-thread invariant.

mod util;

use netloop::{EventLoop, TcpServer};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

#[test]
fn five_connections_round_robin_across_two_worker_loops() {
    util::init();

    let (addr_tx, addr_rx) = mpsc::channel();
    let (up_tx, up_rx) = mpsc::channel::<ThreadId>();

    let server_thread = std::thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "fair-server", false).unwrap();
        server.set_thread_num(2);

        server.set_connection_callback(Arc::new(move |conn: &std::rc::Rc<netloop::Connection>| {
            if conn.is_connected() {
                let _ = up_tx.send(std::thread::current().id());
            }
        }));

        server.start();

        let bound = server.local_addr().unwrap();
        addr_tx.send((bound, event_loop.handle())).unwrap();
        event_loop.run();
    });

    let (bound, handle) = addr_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let mut streams = Vec::new();
    let mut owning_threads = Vec::new();
    for _ in 0..5 {
        let stream = TcpStream::connect(bound).unwrap();
        let thread_id = up_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        owning_threads.push(thread_id);
        streams.push(stream);
    }

    assert_eq!(owning_threads[0], owning_threads[2]);
    assert_eq!(owning_threads[2], owning_threads[4]);
    assert_eq!(owning_threads[1], owning_threads[3]);
    assert_ne!(owning_threads[0], owning_threads[1]);

    drop(streams);
    handle.quit();
    server_thread.join().unwrap();
}
