//! All-atomics stats block backing `get_stats`. Lock-free to read and
//! write from any thread, including the worker's hot path.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    tracked_regions: AtomicU64,
    ring_capacity: AtomicU64,
    ring_depth: AtomicU64,
    dropped_events: AtomicU64,
    native_overhead_bytes: AtomicU64,
    page_protection_available: AtomicBool,
    callback_errors: AtomicU64,
    regions_fault_driven: AtomicU64,
    regions_polling: AtomicU64,
    resolver_timeouts: AtomicU64,
    mprotect_failures: AtomicU64,
    abandoned_slots: AtomicU64,
    events_emitted: AtomicU64,
    faults_observed: AtomicU64,
    storage_errors: AtomicU64,
    page_size: AtomicU32,
}

/// Plain-data snapshot of [`Stats`], suitable to hand across an FFI
/// boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tracked_regions: u64,
    pub ring_capacity: u64,
    pub ring_depth: u64,
    pub dropped_events: u64,
    pub native_overhead_bytes: u64,
    pub page_protection_available: bool,
    pub callback_errors: u64,
    pub regions_fault_driven: u64,
    pub regions_polling: u64,
    pub resolver_timeouts: u64,
    pub mprotect_failures: u64,
    pub abandoned_slots: u64,
    pub events_emitted: u64,
    pub faults_observed: u64,
    pub storage_errors: u64,
    pub page_size: u32,
}

impl Stats {
    pub fn new(ring_capacity: u32, page_size: u32) -> Self {
        let s = Self::default();
        s.ring_capacity.store(ring_capacity as u64, Ordering::Relaxed);
        s.page_size.store(page_size, Ordering::Relaxed);
        s
    }

    pub fn set_page_protection_available(&self, available: bool) {
        self.page_protection_available.store(available, Ordering::Relaxed);
    }

    /// Exposed so the fault handler installer can hand the trampoline a raw
    /// pointer to these two counters without the handler needing access to
    /// the rest of `Stats` (async-signal-safety: the handler only touches
    /// exactly the atomics it needs).
    pub fn dropped_events_atomic(&self) -> &AtomicU64 {
        &self.dropped_events
    }

    pub fn faults_observed_atomic(&self) -> &AtomicU64 {
        &self.faults_observed
    }

    pub fn set_tracked_regions(&self, n: u64) {
        self.tracked_regions.store(n, Ordering::Relaxed);
    }

    pub fn set_ring_depth(&self, depth: u64) {
        self.ring_depth.store(depth, Ordering::Relaxed);
    }

    pub fn inc_dropped_events(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_callback_errors(&self) {
        self.callback_errors.fetch_add(1, Ordering::Relaxed);
        log::warn!("callback panicked or returned an error; event dropped from the caller's view");
    }

    pub fn inc_resolver_timeouts(&self) {
        self.resolver_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mprotect_failures(&self) {
        self.mprotect_failures.fetch_add(1, Ordering::Relaxed);
        log::warn!("mprotect failed while arming a page; region demoted to polling mode");
    }

    pub fn inc_abandoned_slots(&self) {
        self.abandoned_slots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_emitted(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_faults_observed(&self) {
        self.faults_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_storage_errors(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_mode_counts(&self, fault_driven: u64, polling: u64) {
        self.regions_fault_driven.store(fault_driven, Ordering::Relaxed);
        self.regions_polling.store(polling, Ordering::Relaxed);
    }

    pub fn set_native_overhead_bytes(&self, bytes: u64) {
        self.native_overhead_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tracked_regions: self.tracked_regions.load(Ordering::Relaxed),
            ring_capacity: self.ring_capacity.load(Ordering::Relaxed),
            ring_depth: self.ring_depth.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            native_overhead_bytes: self.native_overhead_bytes.load(Ordering::Relaxed),
            page_protection_available: self.page_protection_available.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            regions_fault_driven: self.regions_fault_driven.load(Ordering::Relaxed),
            regions_polling: self.regions_polling.load(Ordering::Relaxed),
            resolver_timeouts: self.resolver_timeouts.load(Ordering::Relaxed),
            mprotect_failures: self.mprotect_failures.load(Ordering::Relaxed),
            abandoned_slots: self.abandoned_slots.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            faults_observed: self.faults_observed.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            page_size: self.page_size.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stats_are_zeroed_except_capacity() {
        let stats = Stats::new(65_536, 4096);
        let snap = stats.snapshot();
        assert_eq!(snap.ring_capacity, 65_536);
        assert_eq!(snap.page_size, 4096);
        assert_eq!(snap.dropped_events, 0);
        assert_eq!(snap.events_emitted, 0);
    }

    #[test]
    fn counters_increment() {
        let stats = Stats::new(1024, 4096);
        stats.inc_dropped_events();
        stats.inc_dropped_events();
        stats.inc_events_emitted();
        let snap = stats.snapshot();
        assert_eq!(snap.dropped_events, 2);
        assert_eq!(snap.events_emitted, 1);
    }
}
