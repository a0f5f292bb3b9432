//! Unix domain socket transport: wire frames over a filesystem socket.
//!
//! The listener unlinks a stale socket file before binding and removes the
//! path again on close so the address can be rebound.

use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use duct_types::{Listener, Message, Pipe, RecvOptions, Result, SendOptions, Status};
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::debug;

use crate::sock;

/// A connected Unix domain socket pipe.
pub struct UdsPipe {
    stream: UnixStream,
    closed: AtomicBool,
}

impl UdsPipe {
    fn new(stream: UnixStream) -> Self {
        sock::set_nosigpipe(stream.as_raw_fd());
        Self {
            stream,
            closed: AtomicBool::new(false),
        }
    }
}

impl Pipe for UdsPipe {
    fn send(&self, msg: &Message, opt: &SendOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        if !opt.timeout.is_zero() {
            sock::wait_writable(self.stream.as_raw_fd(), opt.timeout)?;
        }
        duct_wire::write_frame(&mut &self.stream, msg, 0)
    }

    fn recv(&self, opt: &RecvOptions) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        if !opt.timeout.is_zero() {
            sock::wait_readable(self.stream.as_raw_fd(), opt.timeout)?;
        }
        duct_wire::read_frame(&mut &self.stream)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

impl Drop for UdsPipe {
    fn drop(&mut self) {
        self.close();
    }
}

/// A bound Unix domain socket listener.
pub struct UdsListener {
    inner: UnixListener,
    path: PathBuf,
    closed: AtomicBool,
}

impl Listener for UdsListener {
    fn accept(&self) -> Result<Box<dyn Pipe>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }
        match self.inner.accept() {
            Ok((stream, _)) => {
                debug!(path = %self.path.display(), "uds accept");
                Ok(Box::new(UdsPipe::new(stream)))
            }
            Err(_) if self.closed.load(Ordering::Acquire) => {
                Err(Status::closed("listener closed"))
            }
            Err(e) => Err(Status::io_error(format!("accept() failed: {e}"))),
        }
    }

    fn local_address(&self) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }
        Ok(format!("uds://{}", self.path.display()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        sock::shutdown_fd(self.inner.as_raw_fd());
        // Remove the socket file to allow rebinding.
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for UdsListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bind a listener at `path`, replacing any stale socket file.
pub fn uds_listen(path: &str, backlog: i32) -> Result<UdsListener> {
    let path = Path::new(path);
    // Stale file from a crashed listener keeps bind() from succeeding.
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }

    let addr =
        SockAddr::unix(path).map_err(|e| Status::invalid_argument(format!("uds path: {e}")))?;
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)
        .map_err(|e| Status::io_error(format!("socket(AF_UNIX) failed: {e}")))?;
    socket
        .bind(&addr)
        .map_err(|e| Status::io_error(format!("bind() failed for {}: {e}", path.display())))?;
    socket
        .listen(backlog)
        .map_err(|e| Status::io_error(format!("listen() failed for {}: {e}", path.display())))?;

    debug!(path = %path.display(), "uds listen");
    Ok(UdsListener {
        inner: socket.into(),
        path: path.to_path_buf(),
        closed: AtomicBool::new(false),
    })
}

/// Connect to the socket at `path`, optionally bounded by `timeout`.
pub fn uds_dial(path: &str, timeout: Duration) -> Result<UdsPipe> {
    let stream = if timeout.is_zero() {
        UnixStream::connect(path)
            .map_err(|e| Status::io_error(format!("connect() failed for uds path {path}: {e}")))?
    } else {
        let addr = SockAddr::unix(path)
            .map_err(|e| Status::invalid_argument(format!("uds path: {e}")))?;
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)
            .map_err(|e| Status::io_error(format!("socket(AF_UNIX) failed: {e}")))?;
        socket.connect_timeout(&addr, timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                Status::timeout(format!("connect to uds path {path} timed out"))
            } else {
                Status::io_error(format!("connect() failed for uds path {path}: {e}"))
            }
        })?;
        socket.into()
    };
    debug!(%path, "uds dial");
    Ok(UdsPipe::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use duct_types::StatusCode;
    use std::thread;

    fn socket_path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn echo_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir, "echo.sock");
        let listener = uds_listen(&path, 16).unwrap();
        assert_eq!(listener.local_address().unwrap(), format!("uds://{path}"));

        let server = thread::spawn(move || {
            let pipe = listener.accept().unwrap();
            let msg = pipe.recv(&RecvOptions::default()).unwrap();
            pipe.send(&msg, &SendOptions::default()).unwrap();
        });

        let pipe = uds_dial(&path, Duration::from_secs(5)).unwrap();
        pipe.send(&Message::from_string("ping"), &SendOptions::default())
            .unwrap();
        assert_eq!(pipe.recv(&RecvOptions::default()).unwrap().data(), b"ping");
        server.join().unwrap();
    }

    #[test]
    fn listener_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir, "stale.sock");

        // Simulate a crashed listener leaving its socket file behind.
        let first = uds_listen(&path, 16).unwrap();
        std::mem::forget(first);

        let second = uds_listen(&path, 16).unwrap();
        drop(second);
    }

    #[test]
    fn close_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir, "cleanup.sock");
        let listener = uds_listen(&path, 16).unwrap();
        assert!(Path::new(&path).exists());
        listener.close();
        assert!(!Path::new(&path).exists());
    }

    #[test]
    fn dial_missing_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir, "missing.sock");
        let err = match uds_dial(&path, Duration::ZERO) {
            Err(e) => e,
            Ok(_) => panic!("expected dial to fail"),
        };
        assert_eq!(err.code(), StatusCode::IoError);
    }

    #[test]
    fn recv_after_peer_close_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir, "eof.sock");
        let listener = uds_listen(&path, 16).unwrap();

        let server = thread::spawn(move || {
            let pipe = listener.accept().unwrap();
            pipe.close();
        });

        let pipe = uds_dial(&path, Duration::from_secs(5)).unwrap();
        server.join().unwrap();
        let err = pipe.recv(&RecvOptions::default()).unwrap_err();
        assert_eq!(err.code(), StatusCode::Closed);
    }
}
