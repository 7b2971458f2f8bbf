//! Lock-free ring of fixed-size `PageFault` records.
//!
//! The producer side (`try_publish`) is called from the fault handler and
//! must be async-signal-safe: atomics only, no allocation, no blocking. The
//! consumer side (`drain`) runs on the single worker thread.
//!
//! Slot lifecycle mirrors a sequenced ring: `EMPTY` → producer claims a
//! ticket and flips the slot to `WRITING` → writes the payload → flips to
//! `READY`. If a producer is preempted between claiming and publishing, the
//! consumer reclaims the slot as `ABANDONED` after `REAPER_TIMEOUT_NS`
//! rather than stalling forever.

use memmap2::MmapMut;
use memwatch_common::fault::slot_flags;
use memwatch_common::{PageFault, RingSlot, REAPER_TIMEOUT_NS};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

pub struct PublishError;

pub struct Ring {
    _mmap: MmapMut,
    slots_ptr: *mut RingSlot,
    capacity: u64,
    mask: u64,
    head: AtomicU64,
    tail: AtomicU64,
    global_seq: AtomicU64,
}

// The ring is shared across the host threads that enter the fault handler
// and the single worker thread that drains it; all access to the slots goes
// through atomics on their `flags`/`ticket` fields or is exclusive to the
// worker once a slot is claimed READY.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    pub fn new(capacity: u32) -> std::io::Result<Self> {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let bytes = capacity as usize * std::mem::size_of::<RingSlot>();
        let mut mmap = MmapMut::map_anon(bytes)?;
        let slots_ptr = mmap.as_mut_ptr() as *mut RingSlot;
        // zero-initialize explicitly; MmapMut::map_anon already returns
        // zeroed pages, but we don't want to depend on that guarantee.
        unsafe {
            for i in 0..capacity as usize {
                slots_ptr.add(i).write(RingSlot::zeroed());
            }
        }
        Ok(Self {
            _mmap: mmap,
            slots_ptr,
            capacity: capacity as u64,
            mask: (capacity - 1) as u64,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            global_seq: AtomicU64::new(1),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn depth(&self) -> u64 {
        self.head
            .load(Ordering::Relaxed)
            .wrapping_sub(self.tail.load(Ordering::Relaxed))
    }

    /// Claim the next sequence number. Called by the fault handler so that
    /// `seq` is assigned in the handler and therefore strictly increasing
    /// across all faults, regardless of worker processing order.
    pub fn next_seq(&self) -> u64 {
        self.global_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Async-signal-safe. Attempts to claim a slot and publish `fault`.
    /// Returns `Err(PublishError)` if the ring is full; the caller (the
    /// fault handler) bumps a dropped-events counter and returns.
    pub fn try_publish(&self, fault: PageFault) -> Result<(), PublishError> {
        // CAS loop rather than an unconditional `fetch_add`: advancing
        // `head` commits *some* producer to writing that ticket's slot, so
        // a producer that only discovers the ring was full after advancing
        // head would leave that slot permanently EMPTY, which `drain`
        // would then stop at forever, wedging the whole consumer. Only a
        // producer that wins the CAS (and will therefore actually write)
        // may advance `head`.
        let mut ticket = self.head.load(Ordering::Relaxed);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if ticket.wrapping_sub(tail) >= self.capacity {
                return Err(PublishError);
            }
            match self
                .head
                .compare_exchange_weak(ticket, ticket.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => ticket = current,
            }
        }

        let index = (ticket & self.mask) as usize;
        unsafe {
            let slot = self.slots_ptr.add(index);
            let flags_ptr = std::ptr::addr_of_mut!((*slot).flags) as *mut u8;
            let flags_atomic = AtomicU8::from_ptr(flags_ptr);
            flags_atomic.store(slot_flags::WRITING, Ordering::Release);

            std::ptr::addr_of_mut!((*slot).ticket).write_volatile(ticket);
            std::ptr::addr_of_mut!((*slot).fault).write_volatile(fault);

            flags_atomic.store(slot_flags::READY, Ordering::Release);
        }
        Ok(())
    }

    /// Worker-only. Drains every `READY` slot starting at `tail`, in order,
    /// reclaiming `ABANDONED` slots (stalled producers) after
    /// `REAPER_TIMEOUT_NS`. Stops at the first slot that is neither `READY`
    /// nor reclaimably stale, so ordering is preserved.
    pub fn drain(&self, now_ns: u64, max_batch: usize) -> Vec<PageFault> {
        let mut out = Vec::with_capacity(max_batch.min(64));
        let mut tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        while tail != head && out.len() < max_batch {
            let index = (tail & self.mask) as usize;
            unsafe {
                let slot = self.slots_ptr.add(index);
                let flags_ptr = std::ptr::addr_of_mut!((*slot).flags) as *mut u8;
                let flags_atomic = AtomicU8::from_ptr(flags_ptr);
                let flags = flags_atomic.load(Ordering::Acquire);

                match flags {
                    slot_flags::READY => {
                        let fault = std::ptr::addr_of!((*slot).fault).read_volatile();
                        out.push(fault);
                        flags_atomic.store(slot_flags::EMPTY, Ordering::Release);
                        tail = tail.wrapping_add(1);
                    }
                    slot_flags::WRITING => {
                        let reserved_at =
                            std::ptr::addr_of!((*slot).fault.timestamp_ns).read_volatile();
                        if now_ns.saturating_sub(reserved_at) > REAPER_TIMEOUT_NS {
                            flags_atomic.store(slot_flags::ABANDONED, Ordering::Release);
                            flags_atomic.store(slot_flags::EMPTY, Ordering::Release);
                            tail = tail.wrapping_add(1);
                        } else {
                            // producer still mid-write; stop here to
                            // preserve order, try again next drain.
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }

        self.tail.store(tail, Ordering::Release);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fault(seq: u64) -> PageFault {
        PageFault {
            page_base: 0x1000,
            fault_ip: 0xdead_beef,
            timestamp_ns: 1,
            seq,
            thread_id: 42,
            _pad: 0,
        }
    }

    #[test]
    fn publish_then_drain_round_trips() {
        let ring = Ring::new(16).unwrap();
        ring.try_publish(sample_fault(1)).unwrap();
        ring.try_publish(sample_fault(2)).unwrap();
        let drained = ring.drain(1, 10);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].seq, 1);
        assert_eq!(drained[1].seq, 2);
    }

    #[test]
    fn full_ring_reports_publish_failure() {
        let ring = Ring::new(2).unwrap();
        ring.try_publish(sample_fault(1)).unwrap();
        ring.try_publish(sample_fault(2)).unwrap();
        assert!(ring.try_publish(sample_fault(3)).is_err());
    }

    #[test]
    fn draining_frees_capacity() {
        let ring = Ring::new(2).unwrap();
        ring.try_publish(sample_fault(1)).unwrap();
        ring.try_publish(sample_fault(2)).unwrap();
        assert!(ring.try_publish(sample_fault(3)).is_err());
        let _ = ring.drain(1, 10);
        ring.try_publish(sample_fault(3)).unwrap();
    }

    #[test]
    fn next_seq_is_strictly_increasing() {
        let ring = Ring::new(16).unwrap();
        let a = ring.next_seq();
        let b = ring.next_seq();
        assert!(b > a);
    }

    #[test]
    fn concurrent_producers_never_overwrite_unread_slots() {
        use std::sync::Arc;
        let ring = Arc::new(Ring::new(1024).unwrap());
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    let _ = ring.try_publish(sample_fault(t as u64 * 1000 + i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let drained = ring.drain(1, 10_000);
        assert_eq!(drained.len(), 800);
    }
}
