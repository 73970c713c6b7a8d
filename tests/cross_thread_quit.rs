//! spec.md §8 scenario 6: cross-thread quit. A loop blocked in `poll`
//! must return promptly once another thread calls `quit()` on its
//! handle — not after the full poll timeout.

mod util;

use netloop::EventLoop;
use std::time::{Duration, Instant};

#[test]
fn quit_from_another_thread_wakes_a_blocked_loop_promptly() {
    util::init();

    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let quitter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        handle.quit();
    });

    let started = Instant::now();
    event_loop.run();
    let elapsed = started.elapsed();

    quitter.join().unwrap();

    assert!(
        elapsed < Duration::from_secs(1),
        "run() took {elapsed:?} to return after a cross-thread quit, expected well under the 10s poll timeout"
    );
}
