//! Page Index: maps a page-aligned base address to the regions that touch
//! it, reversing the page granularity of the OS write-protection primitive.
//!
//! One mutex protects all structural mutation; reads go through the same
//! lock. A more elaborate implementation might split this into a
//! linear-probed open-addressed table sized at a multiple of the live page
//! count; a `HashMap` behind a `Mutex` gives the same contract with far
//! less code, and an RW-lock split is a later optimization, not something
//! this layer needs to get right on day one.

use memwatch_common::RegionId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

pub struct PageEntry {
    pub page_base: u64,
    pub regions: Vec<RegionId>,
    /// Set/cleared by the worker under the page index lock. The fault
    /// handler only ever flips a page's *conceptual* protection via the OS
    /// syscall directly; this flag is bookkeeping for the worker's
    /// re-arm decision, not what the handler consults.
    pub protected: AtomicBool,
    pub last_fault_ns: AtomicU64,
    pub fault_rate_ewma: std::sync::atomic::AtomicU64, // f64 bits, see helpers below
}

impl PageEntry {
    fn new(page_base: u64) -> Self {
        Self {
            page_base,
            regions: Vec::new(),
            protected: AtomicBool::new(true),
            last_fault_ns: AtomicU64::new(0),
            fault_rate_ewma: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn fault_rate_ewma(&self) -> f64 {
        f64::from_bits(self.fault_rate_ewma.load(Ordering::Relaxed))
    }

    pub fn set_fault_rate_ewma(&self, value: f64) {
        self.fault_rate_ewma.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct PageIndex {
    pages: Mutex<HashMap<u64, PageEntry>>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link `region_id` into every page entry in `page_bases`, creating
    /// entries as needed.
    pub fn link_region(&self, region_id: RegionId, page_bases: &[u64]) {
        let mut pages = self.pages.lock().unwrap();
        for &base in page_bases {
            let entry = pages.entry(base).or_insert_with(|| PageEntry::new(base));
            if !entry.regions.contains(&region_id) {
                entry.regions.push(region_id);
            }
        }
    }

    /// Remove `region_id` from every page it was linked into. Any page
    /// whose region list becomes empty is dropped from the index and
    /// reported so the caller can lift OS protection on it.
    pub fn unlink_region(&self, region_id: RegionId, page_bases: &[u64]) -> Vec<u64> {
        let mut emptied = Vec::new();
        let mut pages = self.pages.lock().unwrap();
        for &base in page_bases {
            if let Some(entry) = pages.get_mut(&base) {
                entry.regions.retain(|&r| r != region_id);
                if entry.regions.is_empty() {
                    pages.remove(&base);
                    emptied.push(base);
                }
            }
        }
        emptied
    }

    /// Regions touching `page_base`, in the page's stable iteration order.
    pub fn regions_for_page(&self, page_base: u64) -> Vec<RegionId> {
        self.pages
            .lock()
            .unwrap()
            .get(&page_base)
            .map(|e| e.regions.clone())
            .unwrap_or_default()
    }

    pub fn with_page<R>(&self, page_base: u64, f: impl FnOnce(&PageEntry) -> R) -> Option<R> {
        self.pages.lock().unwrap().get(&page_base).map(f)
    }

    pub fn all_page_bases(&self) -> Vec<u64> {
        self.pages.lock().unwrap().keys().copied().collect()
    }

    pub fn contains_page(&self, page_base: u64) -> bool {
        self.pages.lock().unwrap().contains_key(&page_base)
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().unwrap().len()
    }
}

pub fn page_base(addr: usize, page_size: usize) -> u64 {
    (addr & !(page_size - 1)) as u64
}

pub fn pages_touched(addr: usize, size: usize, page_size: usize) -> Vec<u64> {
    let start = page_base(addr, page_size);
    let end = page_base(addr + size - 1, page_size);
    let mut bases = Vec::new();
    let mut base = start;
    loop {
        bases.push(base);
        if base >= end {
            break;
        }
        base += page_size as u64;
    }
    bases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_page_region_touches_one_page() {
        let bases = pages_touched(4096, 256, 4096);
        assert_eq!(bases, vec![4096]);
    }

    #[test]
    fn region_spanning_boundary_touches_two_pages() {
        let bases = pages_touched(4096 - 16, 32, 4096);
        assert_eq!(bases, vec![0, 4096]);
    }

    #[test]
    fn link_and_unlink_round_trip_empties_page() {
        let index = PageIndex::new();
        let region = RegionId(1);
        index.link_region(region, &[4096]);
        assert!(index.contains_page(4096));
        let emptied = index.unlink_region(region, &[4096]);
        assert_eq!(emptied, vec![4096]);
        assert!(!index.contains_page(4096));
    }

    #[test]
    fn two_regions_sharing_a_page_both_listed() {
        let index = PageIndex::new();
        index.link_region(RegionId(1), &[4096]);
        index.link_region(RegionId(2), &[4096]);
        let regions = index.regions_for_page(4096);
        assert_eq!(regions, vec![RegionId(1), RegionId(2)]);
    }

    #[test]
    fn unlinking_one_region_leaves_the_other() {
        let index = PageIndex::new();
        index.link_region(RegionId(1), &[4096]);
        index.link_region(RegionId(2), &[4096]);
        let emptied = index.unlink_region(RegionId(1), &[4096]);
        assert!(emptied.is_empty());
        assert_eq!(index.regions_for_page(4096), vec![RegionId(2)]);
    }
}
