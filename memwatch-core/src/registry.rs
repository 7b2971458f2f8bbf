//! Region Registry: owns `TrackedRegion` records keyed by `region_id`.
//!
//! Allocation is serialized by a single mutex; once a region exists its
//! slot never moves, so lookups by id are array-indexed and lock-free.

use memwatch_common::{AdapterId, RegionId};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::error::WatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionMode {
    FaultDriven = 0,
    Polling = 1,
}

/// One watched byte range. `addr`/`size` are immutable for the region's
/// lifetime; `last_hash`/`epoch`/`mode`/`fault_count_window` are owned by
/// the worker and mutated only there (the fault handler only ever reads
/// `addr`/`size`).
pub struct TrackedRegion {
    pub region_id: RegionId,
    pub adapter_id: AdapterId,
    pub addr: usize,
    pub size: usize,
    pub metadata_ref: u64,
    pub name: Option<String>,
    pub last_hash: AtomicU64,
    pub epoch: AtomicU32,
    pub mode: AtomicU8,
    pub fault_count_window: AtomicU32,
    /// Set once `unwatch` has removed this slot from the page index. A
    /// tombstoned region is skipped by the worker even if a stale fault
    /// record still references its page.
    pub tombstoned: std::sync::atomic::AtomicBool,
    /// Retained previous content, for `old_preview`/`old_value`. Seeded
    /// with the region's content at `watch` time so the first emitted
    /// event carries a real baseline instead of an absent one.
    pub previous_snapshot: Mutex<Option<Vec<u8>>>,
}

impl TrackedRegion {
    pub fn mode(&self) -> RegionMode {
        match self.mode.load(Ordering::Relaxed) {
            1 => RegionMode::Polling,
            _ => RegionMode::FaultDriven,
        }
    }

    pub fn set_mode(&self, mode: RegionMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn is_live(&self) -> bool {
        !self.tombstoned.load(Ordering::Acquire)
    }

    /// # Safety
    /// Caller must ensure `addr..addr+size` is still valid to read (the
    /// core never frees the caller's backing memory, so this only fails if
    /// the host has already done so — a contract violation on the host's
    /// part, not something the registry can enforce).
    pub unsafe fn current_hash(&self) -> u64 {
        crate::hash::hash_region(self.addr, self.size)
    }

    pub unsafe fn current_bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.addr as *const u8, self.size)
    }
}

pub struct Registry {
    grow_lock: Mutex<()>,
    regions: boxcar::Vec,
    next_id: AtomicU32,
    max_regions: usize,
}

/// Minimal append-only, index-stable vector: once a slot is written it
/// never moves, so reads by index need no lock. An arena keyed by
/// `region_id` that never frees slots during a run, so ids are never
/// reused.
mod boxcar {
    use std::sync::RwLock;

    pub struct Vec {
        inner: RwLock<std::vec::Vec<std::sync::Arc<super::TrackedRegion>>>,
    }

    impl Vec {
        pub fn new() -> Self {
            Self {
                inner: RwLock::new(std::vec::Vec::new()),
            }
        }

        pub fn push(&self, region: std::sync::Arc<super::TrackedRegion>) -> usize {
            let mut guard = self.inner.write().unwrap();
            guard.push(region);
            guard.len() - 1
        }

        pub fn get(&self, index: usize) -> Option<std::sync::Arc<super::TrackedRegion>> {
            self.inner.read().unwrap().get(index).cloned()
        }

        pub fn len(&self) -> usize {
            self.inner.read().unwrap().len()
        }

        pub fn iter_snapshot(&self) -> std::vec::Vec<std::sync::Arc<super::TrackedRegion>> {
            self.inner.read().unwrap().clone()
        }
    }
}

impl Registry {
    pub fn new(max_regions: usize) -> Self {
        Self {
            grow_lock: Mutex::new(()),
            regions: boxcar::Vec::new(),
            next_id: AtomicU32::new(1),
            max_regions,
        }
    }

    pub fn watch(
        &self,
        addr: usize,
        size: usize,
        adapter_id: AdapterId,
        metadata_ref: u64,
        name: Option<String>,
    ) -> Result<(RegionId, std::sync::Arc<TrackedRegion>), WatchError> {
        if size == 0 {
            return Err(WatchError::InvalidArgument);
        }

        let _guard = self.grow_lock.lock().unwrap();
        if self.regions.len() >= self.max_regions {
            return Err(WatchError::TooManyRegions);
        }

        let id = RegionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let initial_hash = unsafe { crate::hash::hash_region(addr, size) };
        // SAFETY: the caller's watch contract guarantees addr..addr+size is
        // valid to read for the region's lifetime, same as `current_hash`.
        let initial_snapshot = unsafe { std::slice::from_raw_parts(addr as *const u8, size) }.to_vec();
        let region = std::sync::Arc::new(TrackedRegion {
            region_id: id,
            adapter_id,
            addr,
            size,
            metadata_ref,
            name,
            last_hash: AtomicU64::new(initial_hash),
            epoch: AtomicU32::new(0),
            mode: AtomicU8::new(RegionMode::FaultDriven as u8),
            fault_count_window: AtomicU32::new(0),
            tombstoned: std::sync::atomic::AtomicBool::new(false),
            previous_snapshot: Mutex::new(Some(initial_snapshot)),
        });
        self.regions.push(region.clone());
        Ok((id, region))
    }

    pub fn unwatch(&self, region_id: RegionId) -> bool {
        // index is id - 1 since ids start at 1
        if region_id.0 == 0 {
            return false;
        }
        match self.regions.get(region_id.0 as usize - 1) {
            Some(region) if region.region_id == region_id && region.is_live() => {
                region.tombstoned.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, region_id: RegionId) -> Option<std::sync::Arc<TrackedRegion>> {
        if region_id.0 == 0 {
            return None;
        }
        self.regions
            .get(region_id.0 as usize - 1)
            .filter(|r| r.region_id == region_id)
    }

    pub fn live_count(&self) -> u64 {
        self.regions
            .iter_snapshot()
            .iter()
            .filter(|r| r.is_live())
            .count() as u64
    }

    pub fn mode_counts(&self) -> (u64, u64) {
        let mut fault_driven = 0u64;
        let mut polling = 0u64;
        for region in self.regions.iter_snapshot() {
            if !region.is_live() {
                continue;
            }
            match region.mode() {
                RegionMode::FaultDriven => fault_driven += 1,
                RegionMode::Polling => polling += 1,
            }
        }
        (fault_driven, polling)
    }

    pub fn all_live(&self) -> std::vec::Vec<std::sync::Arc<TrackedRegion>> {
        self.regions
            .iter_snapshot()
            .into_iter()
            .filter(|r| r.is_live())
            .collect()
    }
}
