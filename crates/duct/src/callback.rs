//! Connection-state reporting for non-reconnecting pipes.
//!
//! When a dial carries a state callback but no reconnect policy, this
//! wrapper gives the callback the two transitions a plain connection can
//! make: the first disconnect, and close. Each fires at most once.

use std::sync::atomic::{AtomicBool, Ordering};

use duct_types::{
    ConnectionCallback, ConnectionState, Message, Pipe, RecvOptions, Result, SendOptions, Status,
};

pub struct StateCallbackPipe {
    inner: Box<dyn Pipe>,
    callback: ConnectionCallback,
    closed: AtomicBool,
    disconnected: AtomicBool,
}

impl StateCallbackPipe {
    pub fn new(inner: Box<dyn Pipe>, callback: ConnectionCallback) -> Self {
        Self {
            inner,
            callback,
            closed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    fn report_disconnect(&self, reason: &str) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        (self.callback)(ConnectionState::Disconnected, reason);
    }
}

impl Pipe for StateCallbackPipe {
    fn send(&self, msg: &Message, opt: &SendOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        let result = self.inner.send(msg, opt);
        if let Err(st) = &result
            && st.is_disconnect()
        {
            self.report_disconnect(&format!("send: {}", st.message()));
        }
        result
    }

    fn recv(&self, opt: &RecvOptions) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        let result = self.inner.recv(opt);
        if let Err(st) = &result
            && st.is_disconnect()
        {
            self.report_disconnect(&format!("recv: {}", st.message()));
        }
        result
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        (self.callback)(ConnectionState::Closed, "closed");
        self.inner.close();
    }
}

impl Drop for StateCallbackPipe {
    fn drop(&mut self) {
        self.close();
    }
}
