//! The Pipe and Listener contracts every transport implements.

use crate::message::Message;
use crate::options::{RecvOptions, SendOptions};
use crate::status::Result;

/// A point-to-point full-duplex message transport.
///
/// Implementations preserve message framing and strict FIFO ordering per
/// direction. `close` is idempotent, safe to call from any thread including
/// one racing an in-flight `send`/`recv`, and wakes every operation blocked
/// on the same object; subsequent operations return `Closed`.
pub trait Pipe: Send + Sync {
    fn send(&self, msg: &Message, opt: &SendOptions) -> Result<()>;
    fn recv(&self, opt: &RecvOptions) -> Result<Message>;
    fn close(&self);
}

/// A server-side object that yields one [`Pipe`] per accepted connection.
pub trait Listener: Send + Sync {
    fn accept(&self) -> Result<Box<dyn Pipe>>;

    /// The effective local URI. Useful when binding to an ephemeral port.
    ///
    /// Transports that cannot report it return `NotSupported`.
    fn local_address(&self) -> Result<String> {
        Err(crate::status::Status::not_supported(
            "local_address not supported",
        ))
    }

    fn close(&self);
}
