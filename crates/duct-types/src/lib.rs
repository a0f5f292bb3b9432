//! duct-types: core types for the duct messaging library.
//!
//! This crate defines the vocabulary shared by every transport and overlay:
//! - the [`Status`]/[`Result`] error carrier and its code taxonomy
//! - the shared-ownership [`Message`] payload container
//! - the URI [`Address`] parser
//! - per-call and per-connection option structs
//! - the [`Pipe`] and [`Listener`] contracts

mod address;
mod message;
mod options;
mod pipe;
mod status;

pub use address::Address;
pub use message::Message;
pub use options::{
    BackpressurePolicy, ConnectionCallback, ConnectionState, DialOptions, ListenOptions,
    QosOptions, RecvOptions, Reliability, ReconnectPolicy, SendOptions,
};
pub use pipe::{Listener, Pipe};
pub use status::{Result, Status, StatusCode};
