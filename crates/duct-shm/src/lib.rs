//! duct-shm: the shared-memory transport.
//!
//! A connection is two lock-free single-producer single-consumer rings in
//! one POSIX shared-memory segment, one ring per direction, each gated by a
//! pair of named counting semaphores. Endpoints find each other through a
//! filesystem rendezvous socket: the dialer creates all named resources
//! under a random connection id and announces the id to the listener, which
//! opens the same names.
//!
//! The dialer is the owner: its close unlinks the segment and all four
//! semaphores. The acceptor only releases its handles. If a dialer crashes,
//! stale names are leaked to OS cleanup; connection ids are random, so they
//! are never reused.
//!
//! Unix only. On Windows the `shm` scheme reports `NotSupported`.

#![cfg(unix)]

mod bootstrap;
mod pipe;

pub mod layout;
pub mod names;
pub mod segment;
pub mod sem;

pub use bootstrap::{ShmListener, shm_dial, shm_listen};
pub use layout::{SEGMENT_SIZE, SLOT_COUNT, SLOT_PAYLOAD_MAX};
pub use names::{ShmNames, fnv1a_32, sanitize_name};
pub use pipe::ShmPipe;
