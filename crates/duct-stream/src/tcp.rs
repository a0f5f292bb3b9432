//! TCP transport: wire frames over a connected socket.

use std::net::{self, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use duct_types::{Listener, Message, Pipe, RecvOptions, Result, SendOptions, Status};
use socket2::{Domain, Socket, TcpKeepalive, Type};
use tracing::debug;

#[cfg(unix)]
use std::os::fd::AsRawFd;

#[cfg(unix)]
use crate::sock;

/// A connected TCP pipe.
pub struct TcpPipe {
    stream: TcpStream,
    closed: AtomicBool,
}

impl TcpPipe {
    fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        #[cfg(unix)]
        sock::set_nosigpipe(stream.as_raw_fd());
        Self {
            stream,
            closed: AtomicBool::new(false),
        }
    }
}

impl Pipe for TcpPipe {
    fn send(&self, msg: &Message, opt: &SendOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        #[cfg(unix)]
        if !opt.timeout.is_zero() {
            sock::wait_writable(self.stream.as_raw_fd(), opt.timeout)?;
        }
        #[cfg(not(unix))]
        let _ = opt;
        duct_wire::write_frame(&mut &self.stream, msg, 0)
    }

    fn recv(&self, opt: &RecvOptions) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        #[cfg(unix)]
        if !opt.timeout.is_zero() {
            sock::wait_readable(self.stream.as_raw_fd(), opt.timeout)?;
        }
        #[cfg(not(unix))]
        let _ = opt;
        duct_wire::read_frame(&mut &self.stream)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wakes any thread blocked in send/recv on this socket.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Drop for TcpPipe {
    fn drop(&mut self) {
        self.close();
    }
}

/// A bound TCP listener.
pub struct TcpListener {
    inner: net::TcpListener,
    local: SocketAddr,
    closed: AtomicBool,
}

impl Listener for TcpListener {
    fn accept(&self) -> Result<Box<dyn Pipe>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }
        match self.inner.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "tcp accept");
                Ok(Box::new(TcpPipe::new(stream)))
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
        Ok(format!("tcp://{}:{}", self.local.ip(), self.local.port()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wakes a thread blocked in accept.
        #[cfg(unix)]
        sock::shutdown_fd(self.inner.as_raw_fd());
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Status::io_error(format!("address resolution failed for {host}:{port}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(Status::io_error(format!(
            "address resolution returned nothing for {host}:{port}"
        )));
    }
    Ok(addrs)
}

/// Bind a TCP listener. Binding to port 0 picks an ephemeral port, reported
/// via `local_address`.
pub fn tcp_listen(host: &str, port: u16, backlog: i32) -> Result<TcpListener> {
    let mut last_err = None;
    for addr in resolve(host, port)? {
        match bind_one(addr, backlog) {
            Ok(inner) => {
                let local = inner
                    .local_addr()
                    .map_err(|e| Status::io_error(format!("getsockname failed: {e}")))?;
                debug!(%local, "tcp listen");
                return Ok(TcpListener {
                    inner,
                    local,
                    closed: AtomicBool::new(false),
                });
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Status::io_error("bind/listen failed")))
}

fn bind_one(addr: SocketAddr, backlog: i32) -> Result<net::TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, None)
        .map_err(|e| Status::io_error(format!("socket() failed: {e}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Status::io_error(format!("setsockopt(SO_REUSEADDR) failed: {e}")))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Status::io_error(format!("bind() failed for {addr}: {e}")))?;
    socket
        .listen(backlog)
        .map_err(|e| Status::io_error(format!("listen() failed for {addr}: {e}")))?;
    Ok(socket.into())
}

/// Connect to `host:port`.
///
/// A non-zero `timeout` bounds each connection attempt. A non-zero
/// `keepalive` enables OS TCP keepalive probes at that interval.
pub fn tcp_dial(
    host: &str,
    port: u16,
    timeout: Duration,
    keepalive: Duration,
) -> Result<TcpPipe> {
    let mut last_err = None;
    for addr in resolve(host, port)? {
        let attempt = if timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, timeout)
        };
        match attempt {
            Ok(stream) => {
                if !keepalive.is_zero() {
                    let ka = TcpKeepalive::new()
                        .with_time(keepalive)
                        .with_interval(keepalive);
                    let _ = socket2::SockRef::from(&stream).set_tcp_keepalive(&ka);
                }
                debug!(%addr, "tcp dial");
                return Ok(TcpPipe::new(stream));
            }
            Err(e) => {
                last_err = Some(if e.kind() == std::io::ErrorKind::TimedOut {
                    Status::timeout(format!("connect to {addr} timed out"))
                } else {
                    Status::io_error(format!("connect() failed for {addr}: {e}"))
                });
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Status::io_error("connect() failed")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use duct_types::StatusCode;
    use std::thread;

    #[test]
    fn echo_roundtrip_and_clean_shutdown() {
        let listener = tcp_listen("127.0.0.1", 0, 16).unwrap();
        let uri = listener.local_address().unwrap();
        let port: u16 = uri.rsplit(':').next().unwrap().parse().unwrap();

        let server = thread::spawn(move || {
            let pipe = listener.accept().unwrap();
            let msg = pipe.recv(&RecvOptions::default()).unwrap();
            pipe.send(&msg, &SendOptions::default()).unwrap();
            // Peer closes after reading the echo.
            let err = pipe.recv(&RecvOptions::default()).unwrap_err();
            assert_eq!(err.code(), StatusCode::Closed);
        });

        let pipe = tcp_dial("127.0.0.1", port, Duration::from_secs(5), Duration::ZERO).unwrap();
        pipe.send(&Message::from_string("hello"), &SendOptions::default())
            .unwrap();
        let echoed = pipe.recv(&RecvOptions::default()).unwrap();
        assert_eq!(echoed.data(), b"hello");
        pipe.close();

        server.join().unwrap();
    }

    #[test]
    fn recv_timeout_expires_without_data() {
        let listener = tcp_listen("127.0.0.1", 0, 16).unwrap();
        let uri = listener.local_address().unwrap();
        let port: u16 = uri.rsplit(':').next().unwrap().parse().unwrap();

        let server = thread::spawn(move || {
            let pipe = listener.accept().unwrap();
            // Hold the connection open without sending.
            thread::sleep(Duration::from_millis(300));
            drop(pipe);
        });

        let pipe = tcp_dial("127.0.0.1", port, Duration::from_secs(5), Duration::ZERO).unwrap();
        let err = pipe
            .recv(&RecvOptions {
                timeout: Duration::from_millis(50),
            })
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::Timeout);
        server.join().unwrap();
    }

    #[test]
    fn close_is_idempotent_and_fails_later_ops() {
        let listener = tcp_listen("127.0.0.1", 0, 16).unwrap();
        let uri = listener.local_address().unwrap();
        let port: u16 = uri.rsplit(':').next().unwrap().parse().unwrap();

        let server = thread::spawn(move || {
            let _pipe = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(100));
        });

        let pipe = tcp_dial("127.0.0.1", port, Duration::from_secs(5), Duration::ZERO).unwrap();
        pipe.close();
        pipe.close();
        assert_eq!(
            pipe.recv(&RecvOptions::default()).unwrap_err().code(),
            StatusCode::Closed
        );
        assert_eq!(
            pipe.send(&Message::from_static(b"x"), &SendOptions::default())
                .unwrap_err()
                .code(),
            StatusCode::Closed
        );
        server.join().unwrap();
    }

    #[test]
    fn listener_close_wakes_blocked_accept() {
        let listener = std::sync::Arc::new(tcp_listen("127.0.0.1", 0, 16).unwrap());
        let accepting = listener.clone();
        let handle = thread::spawn(move || accepting.accept());

        thread::sleep(Duration::from_millis(50));
        listener.close();

        let err = handle.join().unwrap().err().expect("accept should fail");
        assert_eq!(err.code(), StatusCode::Closed);
    }

    #[test]
    fn ephemeral_port_is_reported() {
        let listener = tcp_listen("127.0.0.1", 0, 16).unwrap();
        let uri = listener.local_address().unwrap();
        assert!(uri.starts_with("tcp://127.0.0.1:"));
        let port: u16 = uri.rsplit(':').next().unwrap().parse().unwrap();
        assert_ne!(port, 0);
    }

    #[test]
    fn dial_refused_port_is_io_error() {
        let listener = tcp_listen("127.0.0.1", 0, 16).unwrap();
        let uri = listener.local_address().unwrap();
        let port: u16 = uri.rsplit(':').next().unwrap().parse().unwrap();
        listener.close();
        drop(listener);

        let err = match tcp_dial("127.0.0.1", port, Duration::from_secs(1), Duration::ZERO) {
            Err(e) => e,
            Ok(_) => panic!("expected dial to fail"),
        };
        assert_eq!(err.code(), StatusCode::IoError);
    }
}
