//! Per-page fault-rate estimator and mode state machine.
//!
//! `Protected` pages fault-trap on every write; if their EWMA fault rate
//! exceeds `H`, they demote to `Polling` (rescanned on a fixed cadence
//! instead). A polling page that stays quiescent for `cooldown` promotes
//! back to `Protected`.

use crate::page_index::PageEntry;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    DemoteToPolling,
    PromoteToProtected,
}

pub struct ThrottleController {
    pub threshold_hz: f64,
    pub cooldown_ns: u64,
}

impl ThrottleController {
    pub fn new(threshold_hz: f64, cooldown_ms: u64) -> Self {
        Self {
            threshold_hz,
            cooldown_ns: cooldown_ms * 1_000_000,
        }
    }

    /// Record one fault on `page` at `now_ns`, updating its EWMA, and
    /// return whether this observation should change the page's mode.
    /// Call only while already in `Protected` mode; polling-mode pages
    /// don't take this path (they're driven by [`Self::check_quiescence`]).
    pub fn on_fault(&self, page: &PageEntry, now_ns: u64) -> Transition {
        let last = page.last_fault_ns.swap(now_ns, Ordering::Relaxed);
        let dt_ns = now_ns.saturating_sub(last);
        let instant_rate = if dt_ns == 0 {
            self.threshold_hz.max(page.fault_rate_ewma())
        } else {
            1.0e9 / dt_ns as f64
        };

        let prev = page.fault_rate_ewma();
        let updated = prev * 0.9 + instant_rate * 0.1;
        page.set_fault_rate_ewma(updated);

        if updated > self.threshold_hz {
            Transition::DemoteToPolling
        } else {
            Transition::None
        }
    }

    /// Called on the hot-page poll cadence for pages already in `Polling`
    /// mode: if a rescan found no change and quiescence has lasted the
    /// cooldown, promote back to `Protected`.
    pub fn check_quiescence(&self, page: &PageEntry, now_ns: u64, changed: bool) -> Transition {
        if changed {
            page.last_fault_ns.store(now_ns, Ordering::Relaxed);
            return Transition::None;
        }
        let last = page.last_fault_ns.load(Ordering::Relaxed);
        if now_ns.saturating_sub(last) >= self.cooldown_ns {
            Transition::PromoteToProtected
        } else {
            Transition::None
        }
    }
}
