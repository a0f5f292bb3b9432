//! Uniform success/error carrier shared by every duct operation.

use thiserror::Error;

/// Enumerated error taxonomy for all duct operations.
///
/// Success is the `Ok` arm of [`Result`], so there is no `Ok` code here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The caller violated an input contract (bad URI, oversize payload, ...).
    InvalidArgument,
    /// The operation or scheme is not available on this platform or build.
    NotSupported,
    /// Unrecoverable low-level failure (socket errors, shm/sem creation, ...).
    IoError,
    /// A per-call deadline expired without progress.
    Timeout,
    /// Peer closed, local close, or orderly end-of-stream.
    Closed,
    /// The peer sent a byte stream that violates the framing contract.
    ProtocolError,
}

impl StatusCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            StatusCode::InvalidArgument => "Invalid argument",
            StatusCode::NotSupported => "Not supported",
            StatusCode::IoError => "I/O error",
            StatusCode::Timeout => "Timeout",
            StatusCode::Closed => "Closed",
            StatusCode::ProtocolError => "Protocol error",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status code plus a human-readable diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotSupported, message)
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::IoError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Timeout, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Closed, message)
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ProtocolError, message)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for the errors that mean "the connection is gone".
    ///
    /// Only the reconnect overlay recovers from these; every other layer
    /// surfaces them to the caller.
    pub fn is_disconnect(&self) -> bool {
        matches!(self.code, StatusCode::Closed | StatusCode::IoError)
    }
}

/// Either a value or a non-Ok [`Status`].
pub type Result<T> = std::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_name_and_message() {
        let st = Status::protocol_error("bad magic");
        assert_eq!(st.to_string(), "[Protocol error] bad magic");
        assert_eq!(st.code(), StatusCode::ProtocolError);
        assert_eq!(st.message(), "bad magic");
    }

    #[test]
    fn disconnect_classification() {
        assert!(Status::closed("peer closed").is_disconnect());
        assert!(Status::io_error("send() failed").is_disconnect());
        assert!(!Status::timeout("deadline").is_disconnect());
        assert!(!Status::invalid_argument("bad uri").is_disconnect());
        assert!(!Status::protocol_error("bad magic").is_disconnect());
    }

    #[test]
    fn status_is_an_error() {
        fn takes_error(_: &dyn std::error::Error) {}
        takes_error(&Status::not_supported("uds on windows"));
    }
}
