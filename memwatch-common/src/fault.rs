//! Ring-wire types written by the fault handler and drained by the worker.
//!
//! Everything in this module must stay plain-old-data: the fault handler is
//! async-signal-safe and may only write fixed-size, allocation-free records
//! into preallocated memory — see `memwatch-core::fault`.

use bytemuck::{Pod, Zeroable};

/// Default ring capacity, in slots. Power of two so the worker/handler can
/// mask instead of mod.
pub const RING_CAPACITY: u32 = 65_536;
pub const RING_MASK: u64 = (RING_CAPACITY - 1) as u64;

/// A producer that has claimed a slot but not yet published it is given this
/// long to finish writing before the worker reclaims the slot as abandoned.
pub const REAPER_TIMEOUT_NS: u64 = 10_000_000;

pub mod slot_flags {
    pub const EMPTY: u8 = 0;
    pub const WRITING: u8 = 1;
    pub const READY: u8 = 2;
    pub const ABANDONED: u8 = 3;
}

/// One page-write-trap observation, exactly as handed from the fault handler
/// to the worker. Fixed width, no pointers, no allocation.
///
/// `fault_ip` is the instruction pointer of the faulting store, read from the
/// CPU machine context the OS hands the handler — never `si_addr` (that is
/// the data address) and never a return-address builtin.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PageFault {
    pub page_base: u64,
    pub fault_ip: u64,
    pub timestamp_ns: u64,
    pub seq: u64,
    pub thread_id: u32,
    pub _pad: u32,
}

impl PageFault {
    pub const fn zeroed_const() -> Self {
        Self {
            page_base: 0,
            fault_ip: 0,
            timestamp_ns: 0,
            seq: 0,
            thread_id: 0,
            _pad: 0,
        }
    }
}

const _: () = assert!(std::mem::size_of::<PageFault>() <= 48);

/// One ring slot: a one-byte state flag, the ticket this slot was claimed
/// under, and the `PageFault` payload, padded to a cache line so adjacent
/// slots owned by different producers never false-share.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RingSlot {
    pub flags: u8,
    pub _pad1: [u8; 7],
    pub ticket: u64,
    pub fault: PageFault,
}

impl RingSlot {
    pub const fn zeroed() -> Self {
        Self {
            flags: slot_flags::EMPTY,
            _pad1: [0; 7],
            ticket: 0,
            fault: PageFault::zeroed_const(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_fault_fits_in_one_ring_record() {
        assert!(std::mem::size_of::<PageFault>() <= 48);
    }

    #[test]
    fn ring_slot_is_cache_line_aligned() {
        assert_eq!(std::mem::align_of::<RingSlot>(), 64);
        assert_eq!(std::mem::size_of::<RingSlot>() % 64, 0);
    }

    #[test]
    fn ring_capacity_is_power_of_two() {
        assert!(RING_CAPACITY.is_power_of_two());
        assert_eq!(RING_MASK, (RING_CAPACITY - 1) as u64);
    }

    #[test]
    fn zeroed_slot_is_empty() {
        let slot = RingSlot::zeroed();
        assert_eq!(slot.flags, slot_flags::EMPTY);
        assert_eq!(slot.ticket, 0);
    }
}
