//! Windows named pipe transport: wire frames over `\\.\pipe\duct_<name>`.
//!
//! The listener creates one pipe instance per accept and waits for a client
//! to connect; the dialer opens the pipe by name, retrying while all
//! instances are busy. Both ends carry the same wire frames as the socket
//! transports.

use std::ffi::CString;
use std::fs::File;
use std::os::windows::io::{AsRawHandle, FromRawHandle, RawHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use duct_types::{Listener, Message, Pipe, RecvOptions, Result, SendOptions, Status};
use tracing::debug;

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_PIPE_BUSY, ERROR_PIPE_CONNECTED, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{CreateFileA, OPEN_EXISTING};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeA, WaitNamedPipeA, PIPE_ACCESS_DUPLEX,
    PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
};

const PIPE_BUFFER_SIZE: u32 = 64 * 1024;

fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        out.push_str("duct");
    }
    out
}

fn pipe_path(name: &str) -> String {
    format!(r"\\.\pipe\duct_{}", sanitize_name(name))
}

/// A connected named-pipe endpoint.
pub struct NamedPipePipe {
    // File wraps the pipe HANDLE and gives blocking ReadFile/WriteFile
    // semantics through the std Read/Write traits. It is ManuallyDrop so
    // close() and Drop agree on exactly one CloseHandle.
    file: std::mem::ManuallyDrop<File>,
    closed: AtomicBool,
}

impl NamedPipePipe {
    fn from_handle(handle: HANDLE) -> Self {
        // SAFETY: handle is a live, exclusively-owned pipe handle.
        let file = unsafe { File::from_raw_handle(handle as RawHandle) };
        Self {
            file: std::mem::ManuallyDrop::new(file),
            closed: AtomicBool::new(false),
        }
    }
}

impl Drop for NamedPipePipe {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // SAFETY: close() has not run, so the File still owns the handle.
            unsafe { std::mem::ManuallyDrop::drop(&mut self.file) };
        }
    }
}

impl Pipe for NamedPipePipe {
    fn send(&self, msg: &Message, _opt: &SendOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        duct_wire::write_frame(&mut &*self.file, msg, 0)
    }

    fn recv(&self, _opt: &RecvOptions) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        duct_wire::read_frame(&mut &*self.file)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // SAFETY: the handle stays valid until the File is dropped; closing
        // it here wakes a peer blocked on the other end.
        unsafe {
            CloseHandle(self.file.as_raw_handle() as HANDLE);
        }
    }
}

/// A named-pipe listener.
pub struct NamedPipeListener {
    path: CString,
    display: String,
    name: String,
    closed: AtomicBool,
}

impl Listener for NamedPipeListener {
    fn accept(&self) -> Result<Box<dyn Pipe>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }

        // SAFETY: path is a valid NUL-terminated pipe path.
        let handle = unsafe {
            CreateNamedPipeA(
                self.path.as_ptr().cast(),
                PIPE_ACCESS_DUPLEX,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                PIPE_UNLIMITED_INSTANCES,
                PIPE_BUFFER_SIZE,
                PIPE_BUFFER_SIZE,
                0,
                std::ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(Status::io_error(format!(
                "CreateNamedPipe failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: handle is the live pipe instance created above.
        let connected = unsafe { ConnectNamedPipe(handle, std::ptr::null_mut()) };
        if connected == 0 {
            let err = std::io::Error::last_os_error();
            // A client that connected between CreateNamedPipe and
            // ConnectNamedPipe reports ERROR_PIPE_CONNECTED.
            if err.raw_os_error() != Some(ERROR_PIPE_CONNECTED as i32) {
                // SAFETY: handle was created above and is not yet wrapped.
                unsafe { CloseHandle(handle) };
                if self.closed.load(Ordering::Acquire) {
                    return Err(Status::closed("listener closed"));
                }
                return Err(Status::io_error(format!("ConnectNamedPipe failed: {err}")));
            }
        }

        debug!(pipe = %self.display, "named pipe accept");
        Ok(Box::new(NamedPipePipe::from_handle(handle)))
    }

    fn local_address(&self) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }
        Ok(format!("pipe://{}", self.name))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Create a named-pipe listener for `name`.
pub fn pipe_listen(name: &str) -> Result<NamedPipeListener> {
    let display = pipe_path(name);
    let path = CString::new(display.clone())
        .map_err(|_| Status::invalid_argument("pipe name contains NUL"))?;
    debug!(pipe = %display, "named pipe listen");
    Ok(NamedPipeListener {
        path,
        display,
        name: sanitize_name(name),
        closed: AtomicBool::new(false),
    })
}

/// Connect to the named pipe `name`, retrying while instances are busy.
pub fn pipe_dial(name: &str, timeout: Duration) -> Result<NamedPipePipe> {
    let display = pipe_path(name);
    let path = CString::new(display.clone())
        .map_err(|_| Status::invalid_argument("pipe name contains NUL"))?;
    let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

    loop {
        // SAFETY: path is a valid NUL-terminated pipe path.
        let handle = unsafe {
            CreateFileA(
                path.as_ptr().cast(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                std::ptr::null_mut(),
                OPEN_EXISTING,
                0,
                std::ptr::null_mut(),
            )
        };
        if handle != INVALID_HANDLE_VALUE {
            debug!(pipe = %display, "named pipe dial");
            return Ok(NamedPipePipe::from_handle(handle));
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(ERROR_PIPE_BUSY as i32) {
            return Err(Status::io_error(format!(
                "CreateFile({display}) failed: {err}"
            )));
        }

        let wait_ms = match deadline {
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(Status::timeout(format!("connect to {display} timed out")));
                }
                remaining.as_millis().min(u32::MAX as u128) as u32
            }
            None => 1000,
        };
        // SAFETY: path is a valid NUL-terminated pipe path.
        unsafe { WaitNamedPipeA(path.as_ptr().cast(), wait_ms) };
    }
}
