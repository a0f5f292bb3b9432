//! duct-stream: stream transports for duct.
//!
//! Every transport here frames messages with `duct-wire` over a byte
//! stream:
//! - TCP sockets (all platforms)
//! - Unix domain sockets (Unix)
//! - named pipes (Windows)
//!
//! Per-call send/recv timeouts are implemented as readiness waits so the
//! sockets themselves stay blocking.

mod tcp;

#[cfg(unix)]
mod sock;
#[cfg(unix)]
mod uds;

#[cfg(windows)]
mod named_pipe;

pub use tcp::{TcpListener, TcpPipe, tcp_dial, tcp_listen};

#[cfg(unix)]
pub use uds::{UdsListener, UdsPipe, uds_dial, uds_listen};

#[cfg(windows)]
pub use named_pipe::{NamedPipeListener, NamedPipePipe, pipe_dial, pipe_listen};
