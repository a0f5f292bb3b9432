//! duct: transport-agnostic messaging.
//!
//! One `listen` / `dial` / `send` / `recv` surface over multiple
//! transports, selected by URI scheme:
//!
//! - `tcp://host:port` (a bare `host:port` also means tcp)
//! - `shm://name` - lock-free shared-memory rings (Unix)
//! - `uds://path` - Unix domain sockets (Unix)
//! - `pipe://name` - named pipes (Windows)
//!
//! Dials compose overlays on top of the raw transport: a QoS overlay when
//! [`DialOptions::qos`] is set, and a reconnecting virtual pipe when
//! [`DialOptions::reconnect`] is set, giving `Reconnect(Qos(Raw))`.
//!
//! ```no_run
//! use duct::{DialOptions, ListenOptions, Message, RecvOptions, SendOptions};
//!
//! let listener = duct::listen("tcp://127.0.0.1:0", &ListenOptions::default())?;
//! let uri = listener.local_address()?;
//!
//! let pipe = duct::dial(&uri, &DialOptions::default())?;
//! pipe.send(&Message::from_string("hello"), &SendOptions::default())?;
//! # Ok::<(), duct::Status>(())
//! ```

mod callback;
mod qos;
mod queue;
mod reconnect;

pub use duct_types::{
    Address, BackpressurePolicy, ConnectionCallback, ConnectionState, DialOptions, ListenOptions,
    Listener, Message, Pipe, QosOptions, RecvOptions, Reliability, ReconnectPolicy, Result,
    SendOptions, Status, StatusCode,
};
pub use duct_wire as wire;

pub use callback::StateCallbackPipe;
pub use qos::QosPipe;
pub use queue::MessageQueue;
pub use reconnect::{DialOnce, ReconnectPipe};

use std::time::Duration;

/// Per-attempt dial timeout used when a reconnect-enabled dial passes zero,
/// so the reconnect worker can always be interrupted by `close`.
const RECONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a listener for `address`.
///
/// Reconnect has no meaning on the listener side; accepted pipes are
/// returned raw.
pub fn listen(address: &str, opt: &ListenOptions) -> Result<Box<dyn Listener>> {
    let addr = Address::parse(address)?;
    match &addr {
        Address::Tcp { host, port } => {
            Ok(Box::new(duct_stream::tcp_listen(host, *port, opt.backlog)?))
        }
        #[cfg(unix)]
        Address::Uds { path } => Ok(Box::new(duct_stream::uds_listen(path, opt.backlog)?)),
        #[cfg(not(unix))]
        Address::Uds { .. } => Err(Status::not_supported(
            "uds is not available on this platform; use pipe:// instead",
        )),
        #[cfg(unix)]
        Address::Shm { name } => Ok(Box::new(duct_shm::shm_listen(name, opt.backlog)?)),
        #[cfg(not(unix))]
        Address::Shm { .. } => Err(Status::not_supported(
            "shm is not available on this platform",
        )),
        #[cfg(windows)]
        Address::Pipe { name } => Ok(Box::new(duct_stream::pipe_listen(name)?)),
        #[cfg(not(windows))]
        Address::Pipe { .. } => Err(Status::not_supported(
            "pipe is only available on windows; use uds:// instead",
        )),
    }
}

/// Connect to `address` and compose the configured overlays.
pub fn dial(address: &str, opt: &DialOptions) -> Result<Box<dyn Pipe>> {
    let addr = Address::parse(address)?;

    if let Some(qos) = &opt.qos
        && qos.reliability != Reliability::AtMostOnce
    {
        return Err(Status::invalid_argument(
            "at-least-once reliability is reserved and not implemented",
        ));
    }

    match &opt.reconnect {
        Some(policy) => {
            let dial_timeout = if opt.timeout.is_zero() {
                RECONNECT_DIAL_TIMEOUT
            } else {
                opt.timeout
            };
            let qos = opt.qos.clone();
            let keepalive = policy.heartbeat_interval;
            let dial_once: DialOnce = Box::new(move || {
                let raw = dial_raw(&addr, dial_timeout, keepalive)?;
                Ok(apply_qos(raw, qos.clone()))
            });
            Ok(Box::new(ReconnectPipe::new(
                dial_once,
                policy.clone(),
                opt.on_state_change.clone(),
            )))
        }
        None => {
            let raw = dial_raw(&addr, opt.timeout, Duration::ZERO)?;
            let pipe = apply_qos(raw, opt.qos.clone());
            Ok(match &opt.on_state_change {
                Some(cb) => Box::new(StateCallbackPipe::new(pipe, cb.clone())),
                None => pipe,
            })
        }
    }
}

/// One synchronous connection attempt, no overlays.
fn dial_raw(addr: &Address, timeout: Duration, keepalive: Duration) -> Result<Box<dyn Pipe>> {
    match addr {
        Address::Tcp { host, port } => Ok(Box::new(duct_stream::tcp_dial(
            host, *port, timeout, keepalive,
        )?)),
        #[cfg(unix)]
        Address::Uds { path } => Ok(Box::new(duct_stream::uds_dial(path, timeout)?)),
        #[cfg(not(unix))]
        Address::Uds { .. } => Err(Status::not_supported(
            "uds is not available on this platform; use pipe:// instead",
        )),
        #[cfg(unix)]
        Address::Shm { name } => Ok(Box::new(duct_shm::shm_dial(name, timeout)?)),
        #[cfg(not(unix))]
        Address::Shm { .. } => Err(Status::not_supported(
            "shm is not available on this platform",
        )),
        #[cfg(windows)]
        Address::Pipe { name } => Ok(Box::new(duct_stream::pipe_dial(name, timeout)?)),
        #[cfg(not(windows))]
        Address::Pipe { .. } => Err(Status::not_supported(
            "pipe is only available on windows; use uds:// instead",
        )),
    }
}

fn apply_qos(pipe: Box<dyn Pipe>, qos: Option<QosOptions>) -> Box<dyn Pipe> {
    match qos {
        Some(qos) => Box::new(QosPipe::new(pipe, qos)),
        None => pipe,
    }
}
