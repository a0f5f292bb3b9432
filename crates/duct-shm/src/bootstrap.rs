//! The out-of-band rendezvous.
//!
//! A listener binds a unix socket at a path derived from the bus name. A
//! dialer creates the shared segment and semaphores under a random
//! connection id, connects to the socket, and sends exactly the 16 ASCII
//! bytes of that id; the listener opens the same names and hands back a
//! ring pipe. There is no reply on the socket.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use duct_types::{Listener, Pipe, Result, Status};
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::debug;

use crate::layout::{SEGMENT_SIZE, SLOT_COUNT};
use crate::names::{self, CONN_ID_LEN, LISTENER_CONN_ID, ShmNames};
use crate::pipe::{SemSet, ShmPipe, unlink_all};
use crate::segment::ShmSegment;
use crate::sem::NamedSemaphore;

/// Accepts SHM connections announced over the rendezvous socket.
pub struct ShmListener {
    inner: UnixListener,
    names: ShmNames,
    closed: AtomicBool,
}

impl Listener for ShmListener {
    fn accept(&self) -> Result<Box<dyn Pipe>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }

        let (mut stream, _) = match self.inner.accept() {
            Ok(conn) => conn,
            Err(_) if self.closed.load(Ordering::Acquire) => {
                return Err(Status::closed("listener closed"));
            }
            Err(e) => {
                return Err(Status::io_error(format!(
                    "accept(shm rendezvous) failed: {e}"
                )));
            }
        };

        let mut id = [0u8; CONN_ID_LEN];
        stream.read_exact(&mut id).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Status::protocol_error("short connection id on rendezvous")
            } else {
                Status::io_error(format!("read(rendezvous) failed: {e}"))
            }
        })?;
        drop(stream);

        let conn_id = std::str::from_utf8(&id)
            .ok()
            .filter(|s| names::is_valid_conn_id(s))
            .ok_or_else(|| Status::protocol_error("malformed connection id on rendezvous"))?;

        debug!(bus = %self.names.base, %conn_id, "shm accept");
        let n = ShmNames::derive(&self.names.base, conn_id);
        let seg = ShmSegment::open(&n.segment, SEGMENT_SIZE)?;
        let sems = open_sems(&n)?;
        Ok(Box::new(ShmPipe::new(seg, n, sems, false, false)))
    }

    fn local_address(&self) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }
        Ok(format!("shm://{}", self.names.base))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // SAFETY: the listener fd is live until drop.
        unsafe {
            libc::shutdown(self.inner.as_raw_fd(), libc::SHUT_RDWR);
        }
        let _ = std::fs::remove_file(&self.names.rendezvous);
    }
}

impl Drop for ShmListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_sems(n: &ShmNames) -> Result<SemSet> {
    Ok(SemSet {
        c2s_items: NamedSemaphore::open(&n.c2s_items)?,
        c2s_spaces: NamedSemaphore::open(&n.c2s_spaces)?,
        s2c_items: NamedSemaphore::open(&n.s2c_items)?,
        s2c_spaces: NamedSemaphore::open(&n.s2c_spaces)?,
    })
}

fn create_sems(n: &ShmNames) -> Result<SemSet> {
    Ok(SemSet {
        c2s_items: NamedSemaphore::create_exclusive(&n.c2s_items, 0)?,
        c2s_spaces: NamedSemaphore::create_exclusive(&n.c2s_spaces, SLOT_COUNT)?,
        s2c_items: NamedSemaphore::create_exclusive(&n.s2c_items, 0)?,
        s2c_spaces: NamedSemaphore::create_exclusive(&n.s2c_spaces, SLOT_COUNT)?,
    })
}

/// Bind the rendezvous for `bus_name` and accept SHM connections on it.
pub fn shm_listen(bus_name: &str, backlog: i32) -> Result<ShmListener> {
    let names = ShmNames::derive(bus_name, LISTENER_CONN_ID);

    // A stale socket from a crashed listener blocks bind().
    if names.rendezvous.exists() {
        let _ = std::fs::remove_file(&names.rendezvous);
    }

    let addr = SockAddr::unix(&names.rendezvous)
        .map_err(|e| Status::invalid_argument(format!("rendezvous path: {e}")))?;
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)
        .map_err(|e| Status::io_error(format!("socket(AF_UNIX) failed: {e}")))?;
    socket.bind(&addr).map_err(|e| {
        Status::io_error(format!(
            "bind(rendezvous) failed for {}: {e}",
            names.rendezvous.display()
        ))
    })?;
    socket
        .listen(backlog)
        .map_err(|e| Status::io_error(format!("listen(rendezvous) failed: {e}")))?;

    debug!(bus = %names.base, path = %names.rendezvous.display(), "shm listen");
    Ok(ShmListener {
        inner: socket.into(),
        names,
        closed: AtomicBool::new(false),
    })
}

/// Create a new SHM connection to the listener on `bus_name`.
///
/// The dialer owns every named resource it creates here and unlinks them
/// all on close; any failure along the way cleans up before returning.
pub fn shm_dial(bus_name: &str, timeout: Duration) -> Result<ShmPipe> {
    let conn_id = names::random_conn_id();
    let n = ShmNames::derive(bus_name, &conn_id);

    let seg = ShmSegment::create_exclusive(&n.segment, SEGMENT_SIZE)?;
    let sems = match create_sems(&n) {
        Ok(sems) => sems,
        Err(e) => {
            drop(seg);
            unlink_all(&n);
            return Err(e);
        }
    };

    if let Err(e) = announce(&n, &conn_id, timeout) {
        drop(sems);
        drop(seg);
        unlink_all(&n);
        return Err(e);
    }

    debug!(bus = %n.base, %conn_id, "shm dial");
    Ok(ShmPipe::new(seg, n, sems, true, true))
}

fn announce(n: &ShmNames, conn_id: &str, timeout: Duration) -> Result<()> {
    let mut stream = if timeout.is_zero() {
        UnixStream::connect(&n.rendezvous).map_err(|e| {
            Status::io_error(format!(
                "connect(rendezvous) failed for {}: {e}",
                n.rendezvous.display()
            ))
        })?
    } else {
        let addr = SockAddr::unix(&n.rendezvous)
            .map_err(|e| Status::invalid_argument(format!("rendezvous path: {e}")))?;
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)
            .map_err(|e| Status::io_error(format!("socket(AF_UNIX) failed: {e}")))?;
        socket.connect_timeout(&addr, timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                Status::timeout("connect(rendezvous) timed out")
            } else {
                Status::io_error(format!(
                    "connect(rendezvous) failed for {}: {e}",
                    n.rendezvous.display()
                ))
            }
        })?;
        socket.into()
    };

    debug_assert_eq!(conn_id.len(), CONN_ID_LEN);
    stream
        .write_all(conn_id.as_bytes())
        .map_err(|e| Status::io_error(format!("write(rendezvous) failed: {e}")))?;
    Ok(())
}
