//! Socket readiness helpers for per-call timeouts.
//!
//! Per-call send/recv timeouts gate the blocking I/O with a `poll(2)`
//! readiness wait: expiry is reported as `Timeout` without consuming any
//! input, and the socket itself stays in blocking mode.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use duct_types::{Result, Status};

/// Wait for `fd` to become readable within `timeout`.
pub fn wait_readable(fd: RawFd, timeout: Duration) -> Result<()> {
    wait_for(fd, libc::POLLIN, timeout, "readable")
}

/// Wait for `fd` to become writable within `timeout`.
pub fn wait_writable(fd: RawFd, timeout: Duration) -> Result<()> {
    wait_for(fd, libc::POLLOUT, timeout, "writable")
}

fn wait_for(fd: RawFd, events: libc::c_short, timeout: Duration, what: &str) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let remaining_ms = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;

        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: pfd points to one valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, remaining_ms) };
        if rc < 0 {
            let e = std::io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Status::io_error(format!("poll() failed: {e}")));
        }
        if rc == 0 {
            return Err(Status::timeout(format!("wait {what} timed out")));
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(Status::io_error("poll() on invalid descriptor"));
        }
        // POLLERR/POLLHUP also count as ready: the subsequent read/write
        // reports the actual condition (EOF, reset, ...).
        return Ok(());
    }
}

/// Suppress SIGPIPE per-socket where the platform wants it.
///
/// Rust already ignores SIGPIPE process-wide, and Linux sends are covered by
/// that; macOS additionally honors `SO_NOSIGPIPE`.
#[cfg(target_vendor = "apple")]
pub fn set_nosigpipe(fd: RawFd) {
    let one: libc::c_int = 1;
    // SAFETY: setsockopt reads `one` for the provided length.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of_val(&one) as libc::socklen_t,
        );
    }
}

#[cfg(not(target_vendor = "apple"))]
pub fn set_nosigpipe(_fd: RawFd) {}

/// Shut down both directions of a socket to wake a blocked peer thread.
pub fn shutdown_fd(fd: RawFd) {
    // SAFETY: fd is a live socket descriptor owned by the caller.
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}
