//! The ring-backed pipe.
//!
//! Each direction is a single-producer single-consumer ring driven by two
//! counting semaphores: `spaces` gates the producer, `items` gates the
//! consumer. A slot is owned by the producer between its `spaces` wait and
//! `items` post, and by the consumer between its `items` wait and `spaces`
//! post; no locks are involved.

use std::sync::atomic::{AtomicBool, Ordering};

use duct_types::{Message, Pipe, RecvOptions, Result, SendOptions, Status};

use crate::layout::{Ring, SLOT_COUNT, SLOT_PAYLOAD_MAX, ShmLayout, Slot};
use crate::names::ShmNames;
use crate::segment::ShmSegment;
use crate::sem::NamedSemaphore;

/// The four semaphores of one connection, in the same order the dialer
/// creates them.
#[derive(Debug)]
pub(crate) struct SemSet {
    pub c2s_items: NamedSemaphore,
    pub c2s_spaces: NamedSemaphore,
    pub s2c_items: NamedSemaphore,
    pub s2c_spaces: NamedSemaphore,
}

/// Remove every named resource of a connection. Safe to call repeatedly;
/// open handles stay valid until closed.
pub(crate) fn unlink_all(names: &ShmNames) {
    NamedSemaphore::unlink(&names.c2s_items);
    NamedSemaphore::unlink(&names.c2s_spaces);
    NamedSemaphore::unlink(&names.s2c_items);
    NamedSemaphore::unlink(&names.s2c_spaces);
    ShmSegment::unlink(&names.segment);
}

/// A full-duplex pipe over the shared segment.
///
/// `is_client` selects which ring is TX: the dialer produces into `c2s` and
/// consumes `s2c`, the acceptor the reverse. The dialer additionally owns
/// the named resources and unlinks them on close.
#[derive(Debug)]
pub struct ShmPipe {
    seg: ShmSegment,
    names: ShmNames,
    sems: SemSet,
    owner: bool,
    is_client: bool,
    closed: AtomicBool,
}

impl ShmPipe {
    pub(crate) fn new(
        seg: ShmSegment,
        names: ShmNames,
        sems: SemSet,
        owner: bool,
        is_client: bool,
    ) -> Self {
        Self {
            seg,
            names,
            sems,
            owner,
            is_client,
            closed: AtomicBool::new(false),
        }
    }

    /// The derived names backing this connection.
    pub fn names(&self) -> &ShmNames {
        &self.names
    }

    fn layout(&self) -> *mut ShmLayout {
        self.seg.as_ptr().cast()
    }

    fn tx_ring(&self) -> *mut Ring {
        // SAFETY: the segment is at least SEGMENT_SIZE bytes and laid out as
        // ShmLayout by the creator.
        unsafe {
            if self.is_client {
                &raw mut (*self.layout()).c2s
            } else {
                &raw mut (*self.layout()).s2c
            }
        }
    }

    fn rx_ring(&self) -> *mut Ring {
        // SAFETY: as in tx_ring.
        unsafe {
            if self.is_client {
                &raw mut (*self.layout()).s2c
            } else {
                &raw mut (*self.layout()).c2s
            }
        }
    }

    fn close_impl(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Wake a local thread blocked in send/recv: post the two semaphores
        // this side waits on. Nothing else ever waits on them, so the
        // phantom tokens are inert once the closed flag is visible.
        let (tx_spaces, rx_items) = if self.is_client {
            (&self.sems.c2s_spaces, &self.sems.s2c_items)
        } else {
            (&self.sems.s2c_spaces, &self.sems.c2s_items)
        };
        let _ = tx_spaces.post();
        let _ = rx_items.post();

        if self.owner {
            unlink_all(&self.names);
        }
    }
}

impl Pipe for ShmPipe {
    fn send(&self, msg: &Message, opt: &SendOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        if msg.len() > SLOT_PAYLOAD_MAX {
            return Err(Status::invalid_argument("message too large for a shm slot"));
        }

        let (spaces, items) = if self.is_client {
            (&self.sems.c2s_spaces, &self.sems.c2s_items)
        } else {
            (&self.sems.s2c_spaces, &self.sems.s2c_items)
        };

        let timeout = (!opt.timeout.is_zero()).then_some(opt.timeout);
        spaces.wait(timeout)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }

        let ring = self.tx_ring();
        // SAFETY: between the spaces wait and the items post this side owns
        // slot head % SLOT_COUNT exclusively.
        unsafe {
            let head = (*ring).meta.head.load(Ordering::Relaxed);
            let idx = (head % SLOT_COUNT) as usize;
            let slot: *mut Slot = &raw mut (*ring).slots[idx];
            (*slot).len = msg.len() as u32;
            if !msg.is_empty() {
                std::ptr::copy_nonoverlapping(
                    msg.data().as_ptr(),
                    (&raw mut (*slot).data).cast::<u8>(),
                    msg.len(),
                );
            }
            // Publish after the slot body is fully written.
            (*ring).meta.head.store(head.wrapping_add(1), Ordering::Release);
        }
        items.post()
    }

    fn recv(&self, opt: &RecvOptions) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }

        let (items, spaces) = if self.is_client {
            (&self.sems.s2c_items, &self.sems.s2c_spaces)
        } else {
            (&self.sems.c2s_items, &self.sems.c2s_spaces)
        };

        let timeout = (!opt.timeout.is_zero()).then_some(opt.timeout);
        items.wait(timeout)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }

        let ring = self.rx_ring();
        // SAFETY: between the items wait and the spaces post this side owns
        // slot tail % SLOT_COUNT exclusively.
        let msg = unsafe {
            let tail = (*ring).meta.tail.load(Ordering::Relaxed);
            let idx = (tail % SLOT_COUNT) as usize;
            let slot: *const Slot = &raw const (*ring).slots[idx];
            let len = (*slot).len as usize;
            if len > SLOT_PAYLOAD_MAX {
                return Err(Status::protocol_error("shm slot len out of range"));
            }
            let mut buf = vec![0u8; len];
            if len != 0 {
                std::ptr::copy_nonoverlapping(
                    (&raw const (*slot).data).cast::<u8>(),
                    buf.as_mut_ptr(),
                    len,
                );
            }
            // Publish only after the slot body is fully read out.
            (*ring).meta.tail.store(tail.wrapping_add(1), Ordering::Release);
            Message::from_vec(buf)
        };
        spaces.post()?;
        Ok(msg)
    }

    fn close(&self) {
        self.close_impl();
    }
}

impl Drop for ShmPipe {
    fn drop(&mut self) {
        self.close_impl();
    }
}
