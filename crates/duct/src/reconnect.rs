//! Auto-reconnect overlay: a virtual pipe over a dial closure.
//!
//! The pipe exists from construction; a background worker dials, watches
//! for disconnects, and re-dials with exponential backoff. Callers block
//! until connected and their operations retry transparently across
//! disconnects; timeouts and contract errors surface verbatim.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use duct_types::{
    ConnectionCallback, ConnectionState, Message, Pipe, ReconnectPolicy, RecvOptions, Result,
    SendOptions, Status,
};
use rand::Rng;
use tracing::{debug, warn};

/// Produces one fresh connection per invocation. Captures the URI and the
/// non-reconnect dial options.
pub type DialOnce = Box<dyn Fn() -> Result<Box<dyn Pipe>> + Send + Sync>;

struct Inner {
    closed: bool,
    permanently_failed: bool,
    ever_connected: bool,
    state: ConnectionState,
    last_error: String,
    pipe: Option<Arc<dyn Pipe>>,
}

struct Core {
    mu: Mutex<Inner>,
    cv: Condvar,
    callback: Option<ConnectionCallback>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.mu.lock().unwrap()
    }

    /// Record a state change and fire the callback outside the lock.
    ///
    /// The callback sees every transition exactly once; repeated targets
    /// are ignored, which also makes `Closed` fire exactly once.
    fn set_state(&self, next: ConnectionState, reason: &str) {
        {
            let mut inner = self.lock();
            if inner.state == next {
                return;
            }
            inner.state = next;
        }
        debug!(state = %next, %reason, "reconnect state change");
        if let Some(cb) = &self.callback {
            cb(next, reason);
        }
    }

    fn snapshot_pipe(&self) -> Option<Arc<dyn Pipe>> {
        self.lock().pipe.clone()
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn ever_connected(&self) -> bool {
        self.lock().ever_connected
    }

    /// Block until connected, closed, or permanently failed. A non-zero
    /// timeout bounds the wait.
    fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut inner = self.lock();
        while !(inner.closed || inner.permanently_failed || inner.pipe.is_some()) {
            inner = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Status::timeout("connect timed out"));
                    }
                    self.cv.wait_timeout(inner, d - now).unwrap().0
                }
                None => self.cv.wait(inner).unwrap(),
            };
        }
        if inner.closed {
            return Err(Status::closed("pipe closed"));
        }
        if inner.permanently_failed {
            return Err(Status::io_error(format!(
                "reconnect attempts exhausted: {}",
                inner.last_error
            )));
        }
        Ok(())
    }

    /// Drop the current connection after a disconnect error, ignoring stale
    /// reports from a connection that has already been replaced.
    fn mark_disconnected(&self, which: &Arc<dyn Pipe>, reason: String) {
        let stale_pipe;
        let fire;
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            let Some(current) = &inner.pipe else {
                return;
            };
            if !Arc::ptr_eq(current, which) {
                // A superseded connection reported an error after its
                // replacement went live.
                return;
            }
            stale_pipe = inner.pipe.take();
            inner.last_error = reason.clone();
            fire = inner.state != ConnectionState::Disconnected;
            if fire {
                inner.state = ConnectionState::Disconnected;
            }
        }
        // The callback observes Disconnected before the worker (woken below)
        // can report the next transition.
        debug!(%reason, "reconnect connection lost");
        if fire && let Some(cb) = &self.callback {
            cb(ConnectionState::Disconnected, &reason);
        }
        self.cv.notify_all();
        if let Some(pipe) = stale_pipe {
            pipe.close();
        }
    }
}

/// A pipe that dials lazily and survives disconnects.
pub struct ReconnectPipe {
    core: Arc<Core>,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectPipe {
    pub fn new(
        dial_once: DialOnce,
        policy: ReconnectPolicy,
        callback: Option<ConnectionCallback>,
    ) -> Self {
        let core = Arc::new(Core {
            mu: Mutex::new(Inner {
                closed: false,
                permanently_failed: false,
                ever_connected: false,
                state: ConnectionState::Disconnected,
                last_error: String::new(),
                pipe: None,
            }),
            cv: Condvar::new(),
            callback,
        });

        core.set_state(ConnectionState::Connecting, "initial connect");

        let worker = {
            let core = core.clone();
            std::thread::spawn(move || worker_loop(&core, &dial_once, &policy))
        };

        Self {
            core,
            closed: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
        }
    }

    fn close_impl(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let live_pipe;
        {
            let mut inner = self.core.lock();
            inner.closed = true;
            live_pipe = inner.pipe.take();
            self.core.cv.notify_all();
        }
        self.core.set_state(ConnectionState::Closed, "closed");
        if let Some(pipe) = live_pipe {
            pipe.close();
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Pipe for ReconnectPipe {
    fn send(&self, msg: &Message, opt: &SendOptions) -> Result<()> {
        loop {
            self.core.wait_connected(opt.timeout)?;
            let Some(pipe) = self.core.snapshot_pipe() else {
                // Lost the connection between the wait and the snapshot.
                continue;
            };

            match pipe.send(msg, opt) {
                Ok(()) => return Ok(()),
                Err(st) if st.code() == duct_types::StatusCode::Timeout => return Err(st),
                Err(st) if st.is_disconnect() => {
                    self.core
                        .mark_disconnected(&pipe, format!("send: {}", st.message()));
                    // Retry transparently on the next connection.
                }
                Err(st) => return Err(st),
            }
        }
    }

    fn recv(&self, opt: &RecvOptions) -> Result<Message> {
        loop {
            self.core.wait_connected(opt.timeout)?;
            let Some(pipe) = self.core.snapshot_pipe() else {
                continue;
            };

            match pipe.recv(opt) {
                Ok(msg) => return Ok(msg),
                Err(st) if st.code() == duct_types::StatusCode::Timeout => return Err(st),
                Err(st) if st.is_disconnect() => {
                    self.core
                        .mark_disconnected(&pipe, format!("recv: {}", st.message()));
                }
                Err(st) => return Err(st),
            }
        }
    }

    fn close(&self) {
        self.close_impl();
    }
}

impl Drop for ReconnectPipe {
    fn drop(&mut self) {
        self.close_impl();
    }
}

fn worker_loop(core: &Core, dial_once: &DialOnce, policy: &ReconnectPolicy) {
    loop {
        if core.is_closed() {
            return;
        }

        // While connected, sleep until the connection drops or we close.
        {
            let inner = core.lock();
            if inner.pipe.is_some() {
                let _guard = core
                    .cv
                    .wait_while(inner, |inner| !inner.closed && inner.pipe.is_some())
                    .unwrap();
                continue;
            }
            if inner.permanently_failed {
                return;
            }
        }

        let (next_state, reason) = {
            let inner = core.lock();
            let reason = if inner.last_error.is_empty() {
                "connecting".to_string()
            } else {
                inner.last_error.clone()
            };
            let next = if inner.ever_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            };
            (next, reason)
        };
        core.set_state(next_state, &reason);

        if !dial_until_connected(core, dial_once, policy) {
            return;
        }
    }
}

/// Dial with backoff until a connection lands or the pipe is closed or the
/// attempt budget runs out. Returns false when the worker should exit.
fn dial_until_connected(core: &Core, dial_once: &DialOnce, policy: &ReconnectPolicy) -> bool {
    let mut attempts: u32 = 0;
    let mut delay = policy.initial_delay;

    loop {
        if core.is_closed() {
            return false;
        }
        if policy.max_attempts != 0 && attempts >= policy.max_attempts {
            let (reason, fire) = {
                let mut inner = core.lock();
                inner.permanently_failed = true;
                let reason = if inner.last_error.is_empty() {
                    "reconnect attempts exhausted".to_string()
                } else {
                    inner.last_error.clone()
                };
                let fire = inner.state != ConnectionState::Disconnected;
                if fire {
                    inner.state = ConnectionState::Disconnected;
                }
                (reason, fire)
            };
            warn!(%attempts, "reconnect attempts exhausted");
            if fire && let Some(cb) = &core.callback {
                cb(ConnectionState::Disconnected, &reason);
            }
            core.cv.notify_all();
            return false;
        }

        match dial_once() {
            Ok(pipe) => {
                let fire;
                {
                    let mut inner = core.lock();
                    if inner.closed {
                        // close() won the race; the fresh connection is
                        // unwanted.
                        drop(inner);
                        pipe.close();
                        return false;
                    }
                    inner.pipe = Some(Arc::from(pipe));
                    inner.ever_connected = true;
                    inner.last_error.clear();
                    fire = inner.state != ConnectionState::Connected;
                    if fire {
                        inner.state = ConnectionState::Connected;
                    }
                }
                // Report Connected before releasing any waiter, so a caller
                // cannot race a new disconnect report past this one.
                debug!("reconnect connected");
                if fire && let Some(cb) = &core.callback {
                    cb(ConnectionState::Connected, "connected");
                }
                core.cv.notify_all();
                return true;
            }
            Err(st) => {
                attempts += 1;
                debug!(error = %st, %attempts, "dial attempt failed");
                {
                    let mut inner = core.lock();
                    inner.last_error = st.message().to_string();
                }

                // Backoff with uniform jitter in [0, delay/2].
                let jitter_ms = delay.as_millis() as u64 / 2;
                let jitter = if jitter_ms > 0 {
                    Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
                } else {
                    Duration::ZERO
                };

                let inner = core.lock();
                let _guard = core
                    .cv
                    .wait_timeout_while(inner, delay + jitter, |inner| !inner.closed)
                    .unwrap();

                delay = Duration::min(policy.max_delay, delay.mul_f64(policy.backoff_multiplier));
            }
        }
    }
}
