//! In-memory layout of the shared segment.
//!
//! Two rings per connection, one per direction, each a fixed array of
//! 64KiB slots with producer/consumer indices. The slot size matches the
//! wire framing maximum so a message that fits one transport fits them all.

use std::mem::{align_of, size_of};
use std::sync::atomic::AtomicU32;

/// Maximum payload per slot.
pub const SLOT_PAYLOAD_MAX: usize = 64 * 1024;
/// Slots per ring. 64 * 64KiB = 4MiB of payload capacity per direction.
pub const SLOT_COUNT: u32 = 64;

/// Producer/consumer indices for one ring.
///
/// `head` is mutated only by the producer, `tail` only by the consumer.
/// Both are published with release ordering after the slot body they cover
/// has been written (head) or fully read out (tail).
#[repr(C, align(64))]
pub struct RingMeta {
    pub head: AtomicU32,
    pub tail: AtomicU32,
}

/// One message slot.
#[repr(C)]
pub struct Slot {
    pub len: u32,
    pub reserved: u32,
    pub data: [u8; SLOT_PAYLOAD_MAX],
}

/// A single-producer single-consumer ring.
#[repr(C)]
pub struct Ring {
    pub meta: RingMeta,
    pub slots: [Slot; SLOT_COUNT as usize],
}

/// The full segment: client-to-server and server-to-client rings.
#[repr(C)]
pub struct ShmLayout {
    pub c2s: Ring,
    pub s2c: Ring,
}

/// Size of the shared segment in bytes.
pub const SEGMENT_SIZE: usize = size_of::<ShmLayout>();

const _: () = assert!(size_of::<RingMeta>() == 64);
const _: () = assert!(size_of::<Slot>() == 8 + SLOT_PAYLOAD_MAX);
const _: () = assert!(align_of::<ShmLayout>() == 64);
const _: () = assert!(SEGMENT_SIZE == 2 * (64 + SLOT_COUNT as usize * (8 + SLOT_PAYLOAD_MAX)));
