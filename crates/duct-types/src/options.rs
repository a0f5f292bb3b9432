//! Per-call and per-connection option structs.
//!
//! In every option struct a `Duration::ZERO` timeout means "block
//! indefinitely".

use std::sync::Arc;
use std::time::Duration;

/// How a producer reacts when its outbound queue is at the high water mark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait for space, bounded by the per-call timeout.
    #[default]
    Block,
    /// Discard the new message silently; the send still reports success.
    ///
    /// Delivery is at-most-once, and a caller opting into `DropNew` has
    /// asked for exactly this: an `Ok` send means "accepted or shed", not
    /// "will be transmitted".
    DropNew,
    /// Discard the oldest queued message(s) until the new one fits.
    DropOld,
    /// Fail the send immediately with an I/O error.
    FailFast,
}

/// Delivery reliability mode.
///
/// `AtLeastOnce` is reserved: there are no acknowledgements or replay today,
/// so `dial` rejects it rather than silently accepting a value with no
/// effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Reliability {
    #[default]
    AtMostOnce,
    AtLeastOnce,
}

/// Quality-of-service options for the outbound side of a pipe.
#[derive(Debug, Clone, PartialEq)]
pub struct QosOptions {
    /// Outbound queue capacity in bytes. Bytes are more stable than a
    /// message count when payload sizes vary. Zero means unlimited.
    pub snd_hwm_bytes: usize,
    /// Reserved: there is no read-side queueing in this design.
    pub rcv_hwm_bytes: usize,
    pub backpressure: BackpressurePolicy,
    /// Per-message time-to-live; zero disables expiry.
    pub ttl: Duration,
    /// Best-effort drain time for queued outbound messages at close; zero
    /// means immediate close.
    pub linger: Duration,
    /// Reserved; must be [`Reliability::AtMostOnce`].
    pub reliability: Reliability,
}

impl Default for QosOptions {
    fn default() -> Self {
        Self {
            snd_hwm_bytes: 4 * 1024 * 1024,
            rcv_hwm_bytes: 4 * 1024 * 1024,
            backpressure: BackpressurePolicy::Block,
            ttl: Duration::ZERO,
            linger: Duration::ZERO,
            reliability: Reliability::AtMostOnce,
        }
    }
}

/// Reconnection behavior for a dialed pipe.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Initial delay after a disconnect.
    pub initial_delay: Duration,
    /// Maximum backoff delay between attempts.
    pub max_delay: Duration,
    /// Exponential backoff multiplier.
    pub backoff_multiplier: f64,
    /// Maximum consecutive failed attempts; 0 means retry forever.
    pub max_attempts: u32,
    /// Keepalive interval. For tcp this maps to OS TCP keepalive settings.
    /// Zero disables it.
    pub heartbeat_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: 0,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Observable connection lifecycle of a reconnecting pipe.
///
/// `Closed` is terminal; no transition follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoked on every connection state change with a short reason string.
pub type ConnectionCallback = Arc<dyn Fn(ConnectionState, &str) + Send + Sync>;

/// Per-call send options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// If non-zero, the send times out (where the transport supports it).
    pub timeout: Duration,
}

/// Per-call receive options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvOptions {
    pub timeout: Duration,
}

/// Options for [`dial`](https://docs.rs/duct)-style entry points.
#[derive(Clone, Default)]
pub struct DialOptions {
    /// Timeout for a single connection attempt. For reconnect-enabled dials
    /// a zero timeout uses an internal default so the reconnect worker stays
    /// stoppable via `close`.
    pub timeout: Duration,
    /// When set, the dialed pipe is wrapped in a QoS overlay.
    pub qos: Option<QosOptions>,
    /// When set, the dial returns a virtual pipe that connects and
    /// reconnects automatically.
    pub reconnect: Option<ReconnectPolicy>,
    /// Observer for connection state changes.
    pub on_state_change: Option<ConnectionCallback>,
}

impl std::fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialOptions")
            .field("timeout", &self.timeout)
            .field("qos", &self.qos)
            .field("reconnect", &self.reconnect)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

/// Options for `listen`-style entry points.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Reserved for a server-side QoS overlay; accepted pipes are currently
    /// returned raw.
    pub qos: Option<QosOptions>,
    /// Accept backlog for stream listeners.
    pub backlog: i32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            qos: None,
            backlog: 128,
        }
    }
}
