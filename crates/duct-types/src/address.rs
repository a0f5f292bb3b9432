//! URI parsing into per-scheme address variants.
//!
//! The accepted grammar is `[scheme "://"] body` with schemes `tcp`, `uds`,
//! `shm`, and `pipe`. A bare `host:port` with no scheme is interpreted as
//! `tcp`; an empty tcp host means `127.0.0.1`.

use crate::status::{Result, Status};

/// A parsed peer address, tagged by scheme.
///
/// Parsing is platform-independent; platform restrictions (`uds` on Unix,
/// `pipe` on Windows) are enforced at dispatch time so they can report
/// `NotSupported` rather than `InvalidArgument`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Uds { path: String },
    Shm { name: String },
    Pipe { name: String },
}

impl Address {
    /// Parse a URI string.
    ///
    /// Fails with `InvalidArgument` on malformed bodies and on unknown
    /// schemes.
    pub fn parse(raw: &str) -> Result<Address> {
        let (scheme, body) = match raw.find("://") {
            Some(pos) => (&raw[..pos], &raw[pos + 3..]),
            None => ("tcp", raw),
        };

        match scheme {
            "tcp" => parse_tcp(body),
            "uds" => {
                if body.is_empty() {
                    return Err(Status::invalid_argument("uds address must be a non-empty path"));
                }
                Ok(Address::Uds { path: body.to_string() })
            }
            "shm" => {
                if body.is_empty() {
                    return Err(Status::invalid_argument("shm address must be a non-empty name"));
                }
                Ok(Address::Shm { name: body.to_string() })
            }
            "pipe" => {
                if body.is_empty() {
                    return Err(Status::invalid_argument("pipe address must be a non-empty name"));
                }
                Ok(Address::Pipe { name: body.to_string() })
            }
            other => Err(Status::invalid_argument(format!("unknown scheme: {other}"))),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Address::Tcp { .. } => "tcp",
            Address::Uds { .. } => "uds",
            Address::Shm { .. } => "shm",
            Address::Pipe { .. } => "pipe",
        }
    }
}

fn parse_tcp(body: &str) -> Result<Address> {
    let Some(colon) = body.rfind(':') else {
        return Err(Status::invalid_argument("tcp address must be host:port"));
    };
    let host = if body[..colon].is_empty() {
        "127.0.0.1".to_string()
    } else {
        body[..colon].to_string()
    };
    let port: u16 = body[colon + 1..]
        .parse()
        .map_err(|_| Status::invalid_argument("invalid tcp port"))?;
    Ok(Address::Tcp { host, port })
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Address::Uds { path } => write!(f, "uds://{path}"),
            Address::Shm { name } => write!(f, "shm://{name}"),
            Address::Pipe { name } => write!(f, "pipe://{name}"),
        }
    }
}
