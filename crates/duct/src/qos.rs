//! QoS overlay: a bounded outbound queue drained by a worker thread.
//!
//! Sends are decoupled from the wire: the caller pays queue admission
//! (where backpressure applies) and a single worker hands messages to the
//! underlying pipe in order. Receives pass straight through; there is no
//! read-side queueing in this design.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use duct_types::{Message, Pipe, QosOptions, RecvOptions, Result, SendOptions, Status};
use tracing::{debug, warn};

use crate::queue::MessageQueue;

/// A pipe wrapper that queues outbound messages.
///
/// Delivery is at-most-once: messages still queued when the pipe closes or
/// the connection dies are dropped.
pub struct QosPipe {
    inner: Arc<dyn Pipe>,
    queue: Arc<MessageQueue>,
    opts: QosOptions,
    closed: AtomicBool,
    /// True while the worker holds a message it has not yet delivered.
    in_flight: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QosPipe {
    pub fn new(underlying: Box<dyn Pipe>, opts: QosOptions) -> Self {
        let inner: Arc<dyn Pipe> = Arc::from(underlying);
        let queue = Arc::new(MessageQueue::new(
            opts.snd_hwm_bytes,
            opts.backpressure,
            opts.ttl,
        ));
        let in_flight = Arc::new(AtomicBool::new(false));

        let worker = {
            let inner = inner.clone();
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            std::thread::spawn(move || send_worker(&*inner, &queue, &in_flight))
        };

        Self {
            inner,
            queue,
            opts,
            closed: AtomicBool::new(false),
            in_flight,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn close_impl(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Best-effort drain before teardown when linger is configured. The
        // pop-to-in-flight handoff in the worker is not atomic, so an idle
        // observation only counts when it holds across a beat.
        if !self.opts.linger.is_zero() && !self.queue.is_closed() {
            let deadline = Instant::now() + self.opts.linger;
            let mut idle_streak = 0;
            while idle_streak < 2 && Instant::now() < deadline {
                let idle =
                    self.queue.size_msgs() == 0 && !self.in_flight.load(Ordering::Acquire);
                idle_streak = if idle { idle_streak + 1 } else { 0 };
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        // Queue close stops a worker waiting for input; inner close wakes a
        // worker blocked inside send. Join before returning.
        self.queue.close();
        self.inner.close();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Drain the queue until it closes or the connection dies.
fn send_worker(inner: &dyn Pipe, queue: &MessageQueue, in_flight: &AtomicBool) {
    loop {
        let msg = match queue.pop(Duration::ZERO) {
            Ok(msg) => msg,
            // Queue closed: the owner is shutting down.
            Err(_) => return,
        };
        in_flight.store(true, Ordering::Release);

        loop {
            match inner.send(&msg, &SendOptions::default()) {
                Ok(()) => break,
                Err(st) if st.is_disconnect() => {
                    // The connection is gone for good; stop accepting work.
                    warn!(error = %st, "qos worker stopping after disconnect");
                    in_flight.store(false, Ordering::Release);
                    queue.close();
                    return;
                }
                Err(st) => {
                    // Transient (e.g. a timeout on the inner pipe): keep the
                    // message and retry shortly.
                    debug!(error = %st, "qos send retrying");
                    std::thread::sleep(Duration::from_millis(1));
                    if queue.is_closed() {
                        in_flight.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }
        in_flight.store(false, Ordering::Release);
    }
}

impl Pipe for QosPipe {
    fn send(&self, msg: &Message, opt: &SendOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        if self.opts.snd_hwm_bytes > 0 && msg.len() > self.opts.snd_hwm_bytes {
            return Err(Status::invalid_argument(
                "message larger than the send high water mark",
            ));
        }
        self.queue.push(msg, opt.timeout)
    }

    fn recv(&self, opt: &RecvOptions) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        self.inner.recv(opt)
    }

    fn close(&self) {
        self.close_impl();
    }
}

impl Drop for QosPipe {
    fn drop(&mut self) {
        self.close_impl();
    }
}
