//! Poll adapter: timer-driven rescan with the same event semantics as the
//! fault-driven path. Two cadences share this module:
//!
//! - the hot-page cadence, rescanning pages the throttle controller has
//!   demoted to `Polling` mode, and promoting them back after a cooldown;
//! - the global fallback cadence, used instead of the entire fault-driven
//!   path when the platform doesn't support page-level write traps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::worker::Worker;

pub fn run_hot_page_loop(worker: Arc<Worker>, shutdown: Arc<AtomicBool>, interval_ms: u64) {
    while !shutdown.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(interval_ms));
        let now = crate::clock::now_ns();
        for page_base in worker.page_index().all_page_bases() {
            let is_polling = worker
                .page_index()
                .with_page(page_base, |page| !page.protected.load(Ordering::Acquire))
                .unwrap_or(false);
            if !is_polling {
                continue;
            }

            let changed = worker.rescan_page(page_base, now);
            let transition = worker
                .page_index()
                .with_page(page_base, |page| worker.throttle().check_quiescence(page, now, changed))
                .unwrap_or(crate::throttle::Transition::None);

            if transition == crate::throttle::Transition::PromoteToProtected {
                worker.promote_page(page_base);
            }
        }
    }
}

/// Runs instead of the fault-driven path entirely when page protection is
/// unavailable on this platform.
pub fn run_fallback_loop(worker: Arc<Worker>, shutdown: Arc<AtomicBool>, interval_ms: u64) {
    while !shutdown.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(interval_ms));
        let now = crate::clock::now_ns();
        worker.rescan_all(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::event::ChangeEvent;
    use crate::fault::ProtectedPageSet;
    use crate::page_index::PageIndex;
    use crate::registry::Registry;
    use crate::resolver::ResolverTable;
    use crate::ring::Ring;
    use crate::stats::Stats;
    use crate::worker::ChangeCallback;
    use memwatch_common::AdapterId;
    use std::sync::Mutex;

    struct RecordingCallback {
        events: Mutex<Vec<ChangeEvent>>,
    }
    impl ChangeCallback for RecordingCallback {
        fn on_change(&self, event: &ChangeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn fallback_rescan_detects_changes_without_faults() {
        let registry = Arc::new(Registry::new(16));
        let page_index = Arc::new(PageIndex::new());
        let ring = Arc::new(Ring::new(16).unwrap());
        let protected_pages = Arc::new(ProtectedPageSet::new(16));
        let stats = Arc::new(Stats::new(16, 4096));
        let resolvers = Arc::new(ResolverTable::new());
        let callback: Arc<Mutex<Option<Arc<dyn ChangeCallback>>>> = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = Arc::new(Worker::new(
            registry.clone(),
            page_index,
            ring,
            protected_pages,
            stats,
            resolvers,
            callback.clone(),
            CoreConfig::default(),
            4096,
            shutdown,
        ));

        let mut buf = *b"Hello, World!";
        registry
            .watch(buf.as_mut_ptr() as usize, buf.len(), AdapterId(1), 0, None)
            .unwrap();
        buf[0] = b'J';

        let recorder = Arc::new(RecordingCallback {
            events: Mutex::new(Vec::new()),
        });
        *callback.lock().unwrap() = Some(recorder.clone());

        worker.rescan_all(1);
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
    }
}
