//! A thread-safe bounded message queue with backpressure and TTL.
//!
//! Capacity is expressed in bytes rather than messages: byte budgets stay
//! meaningful when payload sizes vary. The queue is the building block of
//! the QoS overlay but stands on its own.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use duct_types::{BackpressurePolicy, Message, Result, Status};

struct QueuedMessage {
    msg: Message,
    deadline: Option<Instant>,
}

struct Inner {
    items: VecDeque<QueuedMessage>,
    total_bytes: usize,
    closed: bool,
}

/// A bounded FIFO of messages.
///
/// `hwm_bytes == 0` means unlimited. When a TTL is configured, expired
/// messages are discarded at the next dequeue or purge and are never
/// returned to a caller.
pub struct MessageQueue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
    hwm_bytes: usize,
    policy: BackpressurePolicy,
    ttl: Duration,
}

impl MessageQueue {
    pub fn new(hwm_bytes: usize, policy: BackpressurePolicy, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                total_bytes: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            hwm_bytes,
            policy,
            ttl,
        }
    }

    fn fits(&self, inner: &Inner, msg_size: usize) -> bool {
        self.hwm_bytes == 0 || inner.total_bytes + msg_size <= self.hwm_bytes
    }

    fn discard_expired_front(&self, inner: &mut Inner, now: Instant) -> usize {
        let mut dropped = 0;
        while let Some(front) = inner.items.front() {
            match front.deadline {
                Some(d) if now > d => {
                    inner.total_bytes -= front.msg.len();
                    inner.items.pop_front();
                    dropped += 1;
                }
                _ => break,
            }
        }
        if dropped > 0 {
            self.not_full.notify_all();
        }
        dropped
    }

    /// Enqueue a message.
    ///
    /// At the high water mark the configured policy decides what happens;
    /// see [`BackpressurePolicy`]. `timeout` bounds the `Block` wait only;
    /// zero blocks indefinitely.
    pub fn push(&self, msg: &Message, timeout: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Status::closed("queue closed"));
        }

        let msg_size = msg.len();
        if !self.fits(&inner, msg_size) {
            match self.policy {
                BackpressurePolicy::Block => {
                    inner = self.wait_for_space(inner, msg_size, timeout)?;
                    if inner.closed {
                        return Err(Status::closed("queue closed"));
                    }
                }
                BackpressurePolicy::DropNew => {
                    // The send still reports success; delivery is
                    // at-most-once and the caller asked for shedding.
                    return Ok(());
                }
                BackpressurePolicy::DropOld => {
                    while !self.fits(&inner, msg_size) && !inner.items.is_empty() {
                        let front = inner.items.pop_front().expect("non-empty");
                        inner.total_bytes -= front.msg.len();
                    }
                }
                BackpressurePolicy::FailFast => {
                    return Err(Status::io_error("queue at high water mark"));
                }
            }
        }

        let deadline = (!self.ttl.is_zero()).then(|| Instant::now() + self.ttl);
        inner.items.push_back(QueuedMessage {
            msg: msg.clone(),
            deadline,
        });
        inner.total_bytes += msg_size;
        self.not_empty.notify_one();
        Ok(())
    }

    fn wait_for_space<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        msg_size: usize,
        timeout: Duration,
    ) -> Result<MutexGuard<'a, Inner>> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        while !inner.closed && !self.fits(&inner, msg_size) {
            inner = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Status::timeout("push timed out waiting for queue space"));
                    }
                    self.not_full.wait_timeout(inner, d - now).unwrap().0
                }
                None => self.not_full.wait(inner).unwrap(),
            };
        }
        Ok(inner)
    }

    /// Dequeue the oldest live message.
    ///
    /// Blocks until a message is available (`Ok`), the queue closes
    /// (`Closed`), or the timeout expires (`Timeout`). Expired messages are
    /// silently discarded along the way.
    pub fn pop(&self, timeout: Duration) -> Result<Message> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut inner = self.inner.lock().unwrap();

        loop {
            self.discard_expired_front(&mut inner, Instant::now());

            if let Some(front) = inner.items.pop_front() {
                inner.total_bytes -= front.msg.len();
                self.not_full.notify_one();
                return Ok(front.msg);
            }
            if inner.closed {
                return Err(Status::closed("queue closed"));
            }

            inner = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Status::timeout("pop timed out waiting for message"));
                    }
                    self.not_empty.wait_timeout(inner, d - now).unwrap().0
                }
                None => self.not_empty.wait(inner).unwrap(),
            };
        }
    }

    /// Dequeue without blocking; `None` when no live message is queued.
    pub fn try_pop(&self) -> Option<Message> {
        let mut inner = self.inner.lock().unwrap();
        self.discard_expired_front(&mut inner, Instant::now());
        let front = inner.items.pop_front()?;
        inner.total_bytes -= front.msg.len();
        self.not_full.notify_one();
        Some(front.msg)
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }

    pub fn size_msgs(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// True when the queue is at or above its high water mark.
    pub fn at_hwm(&self) -> bool {
        self.hwm_bytes > 0 && self.inner.lock().unwrap().total_bytes >= self.hwm_bytes
    }

    /// Close the queue: wakes every waiter, drains nothing. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Remove every expired message, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let before = inner.items.len();
        let mut kept_bytes = 0;
        inner.items.retain(|qm| match qm.deadline {
            Some(d) if now > d => false,
            _ => {
                kept_bytes += qm.msg.len();
                true
            }
        });
        inner.total_bytes = kept_bytes;
        let purged = before - inner.items.len();
        if purged > 0 {
            self.not_full.notify_all();
        }
        purged
    }
}
