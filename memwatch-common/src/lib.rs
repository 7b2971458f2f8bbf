//! Wire-format types shared between `memwatch-core` and any FFI adapter
//! linking against it: the fixed-size ring record the fault handler writes,
//! and the newtype identifiers that cross the ABI boundary as plain
//! integers.

pub mod fault;
pub mod ids;

pub use fault::{PageFault, RingSlot, RING_CAPACITY, RING_MASK, REAPER_TIMEOUT_NS};
pub use ids::{AdapterId, RegionId};
