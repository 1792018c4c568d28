//! Reactor-level invariants: poller/channel agreement, interest round trips.

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use evio::{Channel, EventLoop, LoopHandle};

fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("reactor".to_string())
        .spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run();
        })
        .unwrap();
    (rx.recv().unwrap(), handle)
}

/// A registered fd is visible through the loop, and dropping the interest
/// via enable/disable round-trips the mask back to its initial state.
#[test]
fn test_interest_roundtrip_and_registration() {
    let (handle, loop_thread) = spawn_loop();
    let (reader, _writer) = std::io::pipe().unwrap();
    let fd = reader.as_raw_fd();

    let channel = Channel::new(&handle, fd);
    let (tx, rx) = mpsc::channel();
    let ch = channel.clone();
    let h = handle.clone();
    handle.run_in_loop(move || {
        assert!(!ch.is_reading());
        assert!(!ch.is_writing());

        ch.enable_reading();
        assert!(h.has_channel(fd));

        ch.enable_writing();
        assert!(ch.is_reading());
        assert!(ch.is_writing());

        ch.disable_writing();
        assert!(ch.is_reading());
        assert!(!ch.is_writing());

        ch.disable_all();
        assert!(ch.is_none_interest());
        // Deregistered from the kernel but still known to the poller.
        assert!(h.has_channel(fd));

        ch.remove();
        assert!(!h.has_channel(fd));
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    handle.quit();
    loop_thread.join().unwrap();
}

/// Readable data on a registered fd reaches the channel's read callback on
/// the loop thread.
#[test]
fn test_read_callback_fires() {
    let (handle, loop_thread) = spawn_loop();
    let (reader, mut writer) = std::io::pipe().unwrap();
    let fd = reader.as_raw_fd();

    let channel = Channel::new(&handle, fd);
    let (tx, rx) = mpsc::channel();
    channel.set_read_callback(move || {
        let _ = tx.send(thread::current().name().map(String::from));
    });
    let ch = channel.clone();
    handle.run_in_loop(move || ch.enable_reading());

    writer.write_all(b"wake").unwrap();
    let fired_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(fired_on.as_deref(), Some("reactor"));

    let ch = channel.clone();
    let (done_tx, done_rx) = mpsc::channel();
    handle.run_in_loop(move || {
        ch.disable_all();
        ch.remove();
        done_tx.send(()).unwrap();
    });
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    handle.quit();
    loop_thread.join().unwrap();
}

/// An empty interest set polls to nothing and leaves cross-thread wakeups
/// working.
#[test]
fn test_empty_poll_preserves_wakeup() {
    let (handle, loop_thread) = spawn_loop();

    // No channels registered beyond the internal wakeup fd. A queued task
    // must still rouse the loop promptly.
    let (tx, rx) = mpsc::channel();
    handle.queue_in_loop(move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(1)).unwrap();

    let before = handle.iterations();
    let (tx, rx) = mpsc::channel();
    handle.queue_in_loop(move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(handle.iterations() > before);

    handle.quit();
    loop_thread.join().unwrap();
}

/// The handle refuses reactor mutations from foreign threads.
#[test]
fn test_off_thread_mutation_asserts() {
    let (handle, loop_thread) = spawn_loop();
    let (reader, _writer) = std::io::pipe().unwrap();
    let channel = Channel::new(&handle, reader.as_raw_fd());

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        channel.enable_reading();
    }));
    assert!(result.is_err(), "off-thread enable_reading must panic");

    handle.quit();
    loop_thread.join().unwrap();
}
