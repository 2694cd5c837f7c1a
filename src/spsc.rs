//! Bounded single-producer/single-consumer queue used between the radio
//! receive callback and each channel's output thread, so a slow or blocked
//! UDP sink cannot stall block reassembly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    capacity: usize,
    stopped: AtomicBool,
}

/// Producer handle. `Clone` only so a second handle can be kept around to
/// call [`Sender::stop`] from outside the producer thread; actually pushing
/// items from more than one thread breaks the SPSC contract.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            inner: self.inner.clone(),
        }
    }
}

pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

/// Create a bounded SPSC channel with room for `capacity` items.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        not_empty: Condvar::new(),
        capacity,
        stopped: AtomicBool::new(false),
    });
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

impl<T> Sender<T> {
    /// Enqueue an item, dropping the oldest one if the queue is full. A full
    /// queue means the consumer is behind; this crate prefers losing stale
    /// frames over blocking the producer thread.
    pub fn send(&self, item: T) {
        let mut queue = self.inner.queue.lock().expect("spsc mutex poisoned");
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
        drop(queue);
        self.inner.not_empty.notify_one();
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.not_empty.notify_one();
    }
}

impl<T> Receiver<T> {
    /// Block until an item is available, the channel is stopped, or
    /// `timeout` elapses.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let mut queue = self.inner.queue.lock().expect("spsc mutex poisoned");
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if self.inner.stopped.load(Ordering::SeqCst) {
                return None;
            }
            let (guard, result) = self
                .inner
                .not_empty
                .wait_timeout(queue, timeout)
                .expect("spsc mutex poisoned");
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn send_then_recv() {
        let (tx, rx) = channel(4);
        tx.send(1);
        tx.send(2);
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Some(1));
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Some(2));
    }

    #[test]
    fn full_queue_drops_oldest() {
        let (tx, rx) = channel(2);
        tx.send(1);
        tx.send(2);
        tx.send(3);
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Some(2));
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Some(3));
    }

    #[test]
    fn recv_times_out_when_empty() {
        let (_tx, rx) = channel::<i32>(2);
        assert_eq!(rx.recv_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn stop_wakes_blocked_receiver() {
        let (tx, rx) = channel::<i32>(2);
        let handle = thread::spawn(move || rx.recv_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(10));
        tx.stop();
        assert_eq!(handle.join().unwrap(), None);
    }
}
