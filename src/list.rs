//! FIFO queue of messages with a signalling slot (spec §3.2).
//!
//! Per spec §9 design notes, this deliberately does *not* preserve the
//! original's intrusive singly-linked list + semaphore: traversals only ever
//! happen under the owning lock, so there is no benefit to raw pointer
//! chaining. Grounded on the teacher's `hub/workers.rs` channel-based
//! worker communication, adapted to a blocking-wait deque since consumers
//! here need a bounded-timeout `remove` rather than a non-blocking `recv`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::message::Message;

/// A FIFO of `Message`s serialised by a single lock, with a condition
/// variable consumers block on.
pub struct MessageList {
    queue: Mutex<VecDeque<Message>>,
    signal: Condvar,
}

impl MessageList {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    /// Insert at the tail and wake one waiting consumer.
    pub fn push(&self, msg: Message) {
        let mut q = self.queue.lock().unwrap();
        q.push_back(msg);
        self.signal.notify_one();
    }

    /// Remove from the head, blocking up to `timeout` for an item to
    /// arrive. Returns `None` on timeout.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Message> {
        let mut q = self.queue.lock().unwrap();
        loop {
            if let Some(msg) = q.pop_front() {
                return Some(msg);
            }
            let (guard, result) = self.signal.wait_timeout(q, timeout).unwrap();
            q = guard;
            if result.timed_out() && q.is_empty() {
                return None;
            }
        }
    }

    /// Non-blocking removal from the head.
    pub fn try_pop(&self) -> Option<Message> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain and discard every queued message, as done during interface
    /// teardown (spec §3.2: "destroy ... frees every remaining message").
    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }
}

impl Default for MessageList {
    fn default() -> Self {
        Self::new()
    }
}

/// A single-slot wake used for SREQ/SRSP pairing and fragment ACK waits
/// (`srsp_signal`, `fragment_ack_signal` in spec §3.3/§3.4). Distinct from
/// `MessageList` because exactly one value is ever pending and the waiter
/// consumes it directly rather than pulling from a queue.
pub struct SignalSlot<T> {
    inner: Mutex<Option<T>>,
    signal: Condvar,
}

impl<T> SignalSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            signal: Condvar::new(),
        }
    }

    /// Deposit a value and wake the waiter.
    pub fn signal(&self, value: T) {
        let mut slot = self.inner.lock().unwrap();
        *slot = Some(value);
        self.signal.notify_one();
    }

    /// Block up to `timeout` for a value, clearing the slot on success.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let mut slot = self.inner.lock().unwrap();
        if slot.is_some() {
            return slot.take();
        }
        let (mut guard, result) = self.signal.wait_timeout(slot, timeout).unwrap();
        if guard.is_some() {
            return guard.take();
        }
        let _ = result;
        None
    }

    /// Clear any pending value without waiting (used when abandoning a
    /// wait, e.g. during teardown).
    pub fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }
}

impl<T> Default for SignalSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutex with a bounded-wait `acquire`, used for `tx_lock`
/// (spec §3.3/§5: "tx_lock acquisition (bounded by tx_lock_timeout)").
/// `std::sync::Mutex` has no timed lock; this layers one on top of a
/// `Condvar`, the same primitive `MessageList`/`SignalSlot` already use.
pub struct TimedLock {
    locked: Mutex<bool>,
    signal: Condvar,
}

pub struct TimedLockGuard<'a> {
    lock: &'a TimedLock,
}

impl TimedLock {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    /// Block up to `timeout` to acquire the lock; `None` on timeout.
    pub fn acquire(&self, timeout: Duration) -> Option<TimedLockGuard<'_>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self.signal.wait_timeout(locked, remaining).unwrap();
            locked = guard;
            if result.timed_out() && *locked {
                return None;
            }
        }
        *locked = true;
        Some(TimedLockGuard { lock: self })
    }
}

impl Default for TimedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimedLockGuard<'_> {
    fn drop(&mut self) {
        *self.lock.locked.lock().unwrap() = false;
        self.lock.signal.notify_one();
    }
}

#[cfg(test)]
mod timed_lock_tests {
    use super::*;

    #[test]
    fn second_acquire_times_out_while_held() {
        let lock = TimedLock::new();
        let _guard = lock.acquire(Duration::from_millis(50)).unwrap();
        assert!(lock.acquire(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn lock_is_reacquirable_after_guard_drops() {
        let lock = TimedLock::new();
        {
            let _guard = lock.acquire(Duration::from_millis(50)).unwrap();
        }
        assert!(lock.acquire(Duration::from_millis(50)).is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_then_pop_preserves_order() {
        let list = MessageList::new();
        list.push(Message::new(1, 0, "[test]"));
        list.push(Message::new(2, 0, "[test]"));
        let a = list.pop_timeout(Duration::from_millis(10)).unwrap();
        let b = list.pop_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(a.cmd0, 1);
        assert_eq!(b.cmd0, 2);
    }

    #[test]
    fn pop_timeout_on_empty_list_returns_none() {
        let list = MessageList::new();
        assert!(list.pop_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn signal_slot_wakes_waiter() {
        let slot = Arc::new(SignalSlot::<u32>::new());
        let slot2 = Arc::clone(&slot);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            slot2.signal(42);
        });
        let got = slot.wait_timeout(Duration::from_secs(1));
        handle.join().unwrap();
        assert_eq!(got, Some(42));
    }

    #[test]
    fn signal_slot_times_out_when_nothing_arrives() {
        let slot = SignalSlot::<u32>::new();
        assert_eq!(slot.wait_timeout(Duration::from_millis(5)), None);
    }
}
