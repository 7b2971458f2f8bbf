//! Worker: drains the ring, re-hashes faulted regions, materializes and
//! delivers events, re-arms protection after the writable window.
//!
//! Single thread, cooperative with the host: it does all allocation, all
//! hashing, and all callback invocation, so the fault handler never has
//! to.

use memwatch_common::{AdapterId, PageFault, RegionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::CoreConfig;
use crate::event::{ChangeEvent, Where};
use crate::fault::ProtectedPageSet;
use crate::page_index::PageIndex;
use crate::protect;
use crate::registry::{Registry, RegionMode, TrackedRegion};
use crate::resolver::ResolverTable;
use crate::ring::Ring;
use crate::stats::Stats;
use crate::throttle::{ThrottleController, Transition};

/// Callback seam for delivered events — the safe-Rust equivalent of a raw
/// `(ChangeEvent *, user_ctx)` function pointer. The FFI crate adapts a raw
/// `extern "C" fn` into one of these.
pub trait ChangeCallback: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

pub struct Worker {
    registry: Arc<Registry>,
    page_index: Arc<PageIndex>,
    ring: Arc<Ring>,
    protected_pages: Arc<ProtectedPageSet>,
    stats: Arc<Stats>,
    resolvers: Arc<ResolverTable>,
    callback: Arc<Mutex<Option<Arc<dyn ChangeCallback>>>>,
    throttle: ThrottleController,
    config: CoreConfig,
    page_size: usize,
    shutdown: Arc<AtomicBool>,
    /// Outbox for `check_changes`, a polling-mode convenience read that
    /// works as an alternative to registering a callback. Every delivered
    /// event is pushed here in addition to being handed to the callback,
    /// if any.
    pending: Mutex<std::collections::VecDeque<ChangeEvent>>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        page_index: Arc<PageIndex>,
        ring: Arc<Ring>,
        protected_pages: Arc<ProtectedPageSet>,
        stats: Arc<Stats>,
        resolvers: Arc<ResolverTable>,
        callback: Arc<Mutex<Option<Arc<dyn ChangeCallback>>>>,
        config: CoreConfig,
        page_size: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let throttle = ThrottleController::new(config.throttle_threshold_hz, config.throttle_cooldown_ms);
        Self {
            registry,
            page_index,
            ring,
            protected_pages,
            stats,
            resolvers,
            callback,
            throttle,
            config,
            page_size,
            shutdown,
            pending: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Drain up to `max` pending events into the caller's buffer.
    pub fn check_changes(&self, max: usize) -> Vec<ChangeEvent> {
        let mut pending = self.pending.lock().unwrap();
        let n = max.min(pending.len());
        pending.drain(..n).collect()
    }

    pub fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                // drain whatever remains so in-flight faults aren't lost
                // on a clean shutdown, then stop.
                self.drain_and_process(256);
                return;
            }

            let processed = self.drain_and_process(256);
            if processed == 0 {
                std::thread::sleep(Duration::from_millis(self.config.worker_idle_sleep_ms));
            }
        }
    }

    fn drain_and_process(&self, max_batch: usize) -> usize {
        let now = crate::clock::now_ns();
        let faults = self.ring.drain(now, max_batch);
        self.stats.set_ring_depth(self.ring.depth());

        for fault in &faults {
            self.process_fault(fault, now);
        }

        // Sweep every known page on each pass, not just ones that faulted
        // in this batch: a page whose writable window elapses with no
        // further writes would otherwise never see `maybe_rearm` again,
        // since there'd be no new fault to trigger it. `run`'s own loop
        // cadence (immediate while busy, `worker_idle_sleep_ms` while idle)
        // is what gives this sweep its period.
        for page_base in self.page_index.all_page_bases() {
            self.maybe_rearm(page_base, now);
        }

        let (fault_driven, polling) = self.registry.mode_counts();
        self.stats.set_mode_counts(fault_driven, polling);
        self.stats.set_tracked_regions(self.registry.live_count());

        faults.len()
    }

    fn process_fault(&self, fault: &PageFault, now: u64) {
        let region_ids = self.page_index.regions_for_page(fault.page_base);
        for region_id in region_ids {
            let Some(region) = self.registry.get(region_id) else {
                continue;
            };
            if !region.is_live() {
                continue;
            }
            self.rehash_and_maybe_emit(&region, Some(fault.fault_ip), Some(fault.thread_id), now);
        }

        let transition = self
            .page_index
            .with_page(fault.page_base, |page| self.throttle.on_fault(page, now))
            .unwrap_or(Transition::None);

        if transition == Transition::DemoteToPolling {
            self.demote_page(fault.page_base);
        }
    }

    fn rehash_and_maybe_emit(
        &self,
        region: &Arc<TrackedRegion>,
        fault_ip: Option<u64>,
        thread_id: Option<u32>,
        now: u64,
    ) {
        let current_hash = unsafe { region.current_hash() };
        let last_hash = region.last_hash.load(Ordering::Relaxed);
        if current_hash == last_hash {
            // false positive: another region sharing this page changed,
            // not this one.
            return;
        }

        let event = self.materialize_event(region, fault_ip, thread_id, now);
        region.last_hash.store(current_hash, Ordering::Relaxed);
        region.epoch.fetch_add(1, Ordering::Relaxed);
        self.deliver(&event);
    }

    fn materialize_event(
        &self,
        region: &Arc<TrackedRegion>,
        fault_ip: Option<u64>,
        thread_id: Option<u32>,
        now: u64,
    ) -> ChangeEvent {
        let bytes = unsafe { region.current_bytes() };
        let preview_len = self.config.preview_size.min(bytes.len());
        let new_preview = bytes[..preview_len].to_vec();

        let epoch = region.epoch.load(Ordering::Relaxed) + 1;
        let (new_value, storage_key_new) = if region.size <= self.config.small_threshold {
            (Some(bytes.to_vec()), None)
        } else {
            (
                None,
                Some(format!(
                    "memwatch/{}/{}/{}",
                    region.adapter_id, region.region_id, epoch
                )),
            )
        };

        let mut previous = region.previous_snapshot.lock().unwrap();
        let (old_preview, old_value, storage_key_old) = match previous.as_ref() {
            Some(prev) => {
                let old_preview_len = self.config.preview_size.min(prev.len());
                let old_preview = Some(prev[..old_preview_len].to_vec());
                if prev.len() <= self.config.small_threshold {
                    (old_preview, Some(prev.clone()), None)
                } else {
                    (
                        old_preview,
                        None,
                        Some(format!(
                            "memwatch/{}/{}/{}",
                            region.adapter_id,
                            region.region_id,
                            epoch.saturating_sub(1)
                        )),
                    )
                }
            }
            None => (None, None, None),
        };
        *previous = Some(bytes.to_vec());
        drop(previous);

        let where_ = if let Some(fault_ip) = fault_ip {
            let location = self.resolvers.resolve(
                region.adapter_id,
                fault_ip,
                Duration::from_millis(self.config.resolver_timeout_ms),
            );
            match location {
                Some(loc) => Where {
                    file: loc.file,
                    function: loc.function,
                    line: loc.line,
                    fault_ip: Some(fault_ip),
                    thread_id,
                },
                None => {
                    self.stats.inc_resolver_timeouts();
                    Where {
                        fault_ip: Some(fault_ip),
                        thread_id,
                        ..Default::default()
                    }
                }
            }
        } else {
            Where::default()
        };

        self.stats.inc_events_emitted();

        ChangeEvent {
            seq: self.ring.next_seq(),
            timestamp_ns: now,
            adapter_id: region.adapter_id,
            region_id: region.region_id,
            variable_name: region.name.clone(),
            r#where: where_,
            how_big: region.size,
            old_preview,
            new_preview,
            old_value,
            new_value,
            storage_key_old,
            storage_key_new,
            metadata_ref: region.metadata_ref,
        }
    }

    fn deliver(&self, event: &ChangeEvent) {
        self.pending.lock().unwrap().push_back(event.clone());

        let callback = self.callback.lock().unwrap().clone();
        let Some(callback) = callback else {
            return;
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback.on_change(event);
        }));
        if result.is_err() {
            self.stats.inc_callback_errors();
        }
    }

    fn demote_page(&self, page_base: u64) {
        let region_ids = self.page_index.regions_for_page(page_base);
        for region_id in region_ids {
            if let Some(region) = self.registry.get(region_id) {
                region.set_mode(RegionMode::Polling);
            }
        }
        self.page_index.with_page(page_base, |page| {
            page.protected.store(false, Ordering::Release);
        });
        // Leave the page OS-writable; the hot-page poll cadence takes over
        // re-hashing instead of fault trapping.
        let _ = protect::protect_read_write(page_base as usize, self.page_size);
        log::debug!("page {page_base:#x} demoted to polling mode (fault rate exceeded threshold)");
    }

    pub fn promote_page(&self, page_base: u64) {
        let region_ids = self.page_index.regions_for_page(page_base);
        for region_id in &region_ids {
            if let Some(region) = self.registry.get(*region_id) {
                // re-baseline before re-protecting, so a change that
                // happened while polling doesn't get lost as a "no-op"
                // re-hash the instant fault-driven mode resumes.
                region.last_hash.store(unsafe { region.current_hash() }, Ordering::Relaxed);
                region.set_mode(RegionMode::FaultDriven);
            }
        }
        if protect::protect_read_only(page_base as usize, self.page_size).is_ok() {
            self.page_index.with_page(page_base, |page| {
                page.protected.store(true, Ordering::Release);
            });
            self.protected_pages.insert(page_base);
            log::debug!("page {page_base:#x} promoted back to fault-driven mode after cooldown");
        } else {
            self.stats.inc_mprotect_failures();
        }
    }

    fn maybe_rearm(&self, page_base: u64, now: u64) {
        let should_rearm = self
            .page_index
            .with_page(page_base, |page| {
                if !page.protected.load(Ordering::Acquire) {
                    return false; // polling mode; nothing to re-arm
                }
                let last_fault = page.last_fault_ns.load(Ordering::Relaxed);
                now.saturating_sub(last_fault) >= self.config.writable_window_ms * 1_000_000
            })
            .unwrap_or(false);

        if should_rearm {
            if protect::protect_read_only(page_base as usize, self.page_size).is_err() {
                self.stats.inc_mprotect_failures();
            }
        }
    }

    /// Rescan every live region on `page_base` (used by the poll adapter
    /// for hot pages) and report whether any region's content changed.
    pub fn rescan_page(&self, page_base: u64, now: u64) -> bool {
        let region_ids = self.page_index.regions_for_page(page_base);
        let mut changed = false;
        for region_id in region_ids {
            let Some(region) = self.registry.get(region_id) else {
                continue;
            };
            if !region.is_live() {
                continue;
            }
            let current = unsafe { region.current_hash() };
            if current != region.last_hash.load(Ordering::Relaxed) {
                changed = true;
                self.rehash_and_maybe_emit(&region, None, None, now);
            }
        }
        changed
    }

    /// Rescan every live region regardless of page (global poll-adapter
    /// fallback path).
    pub fn rescan_all(&self, now: u64) {
        for region in self.registry.all_live() {
            let current = unsafe { region.current_hash() };
            if current != region.last_hash.load(Ordering::Relaxed) {
                self.rehash_and_maybe_emit(&region, None, None, now);
            }
        }
    }

    pub fn throttle(&self) -> &ThrottleController {
        &self.throttle
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn page_index(&self) -> &Arc<PageIndex> {
        &self.page_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingCallback {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl ChangeCallback for RecordingCallback {
        fn on_change(&self, event: &ChangeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn build_worker(page_size: usize) -> (Worker, Arc<Registry>, Arc<PageIndex>) {
        let registry = Arc::new(Registry::new(1024));
        let page_index = Arc::new(PageIndex::new());
        let ring = Arc::new(Ring::new(1024).unwrap());
        let protected_pages = Arc::new(ProtectedPageSet::new(1024));
        let stats = Arc::new(Stats::new(1024, page_size as u32));
        let resolvers = Arc::new(ResolverTable::new());
        let callback: Arc<Mutex<Option<Arc<dyn ChangeCallback>>>> = Arc::new(Mutex::new(None));
        let config = CoreConfig::default();
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(
            registry.clone(),
            page_index.clone(),
            ring,
            protected_pages,
            stats,
            resolvers,
            callback,
            config,
            page_size,
            shutdown,
        );
        (worker, registry, page_index)
    }

    #[test]
    fn small_buffer_change_emits_inline_event() {
        let (worker, registry, _) = build_worker(4096);
        let mut buf = *b"Hello, World!";
        let (id, region) = registry
            .watch(buf.as_mut_ptr() as usize, buf.len(), AdapterId(1), 0, None)
            .unwrap();
        buf[0] = b'J';

        let recorder = Arc::new(RecordingCallback {
            events: Mutex::new(Vec::new()),
        });
        *worker.callback.lock().unwrap() = Some(recorder.clone());

        worker.rehash_and_maybe_emit(&region, None, None, 1);

        let recorded = recorder.events.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].region_id, id);
        assert_eq!(recorded[0].new_value.as_deref(), Some(&b"Jello, World!"[..]));
    }

    #[test]
    fn unchanged_region_emits_nothing() {
        let (worker, registry, _) = build_worker(4096);
        let buf = *b"Hello, World!";
        let (_, region) = registry
            .watch(buf.as_ptr() as usize, buf.len(), AdapterId(1), 0, None)
            .unwrap();
        let recorder = Arc::new(RecordingCallback {
            events: Mutex::new(Vec::new()),
        });
        *worker.callback.lock().unwrap() = Some(recorder.clone());

        worker.rehash_and_maybe_emit(&region, None, None, 1);
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn check_changes_drains_the_pending_outbox_without_a_callback() {
        let (worker, registry, _) = build_worker(4096);
        let mut buf = *b"Hello, World!";
        let (_, region) = registry
            .watch(buf.as_mut_ptr() as usize, buf.len(), AdapterId(1), 0, None)
            .unwrap();
        buf[0] = b'J';

        worker.rehash_and_maybe_emit(&region, None, None, 1);

        let drained = worker.check_changes(10);
        assert_eq!(drained.len(), 1);
        assert!(worker.check_changes(10).is_empty());
    }

    #[test]
    fn large_region_gets_storage_key_not_inline_value() {
        let (worker, registry, _) = build_worker(4096);
        let mut buf = vec![0u8; 1_048_576];
        let (_, region) = registry
            .watch(buf.as_mut_ptr() as usize, buf.len(), AdapterId(1), 0, None)
            .unwrap();
        buf[1000] = 0xFF;

        let recorder = Arc::new(RecordingCallback {
            events: Mutex::new(Vec::new()),
        });
        *worker.callback.lock().unwrap() = Some(recorder.clone());
        worker.rehash_and_maybe_emit(&region, None, None, 1);

        let recorded = recorder.events.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].new_value.is_none());
        assert!(recorded[0].storage_key_new.is_some());
        assert_eq!(recorded[0].new_preview, vec![0u8; 256]);
    }

    #[test]
    fn page_sharing_only_emits_for_the_changed_region() {
        let (worker, registry, page_index) = build_worker(4096);
        let mut page = vec![0u8; 512];
        let base = page.as_mut_ptr() as usize;
        let (id_a, _) = registry.watch(base, 256, AdapterId(1), 0, None).unwrap();
        let (id_b, _) = registry.watch(base + 256, 256, AdapterId(1), 0, None).unwrap();
        page_index.link_region(id_a, &[base as u64]);
        page_index.link_region(id_b, &[base as u64]);

        page[0] = 1;

        let recorder = Arc::new(RecordingCallback {
            events: Mutex::new(Vec::new()),
        });
        *worker.callback.lock().unwrap() = Some(recorder.clone());

        let fault = PageFault {
            page_base: base as u64,
            fault_ip: 0,
            timestamp_ns: 1,
            seq: 1,
            thread_id: 1,
            _pad: 0,
        };
        worker.process_fault(&fault, 1);

        let recorded = recorder.events.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].region_id, id_a);
    }

    #[test]
    fn unwatch_then_write_produces_no_further_events() {
        let (worker, registry, page_index) = build_worker(4096);
        let mut buf = vec![0u8; 16];
        let base = buf.as_mut_ptr() as usize;
        let (id, _) = registry.watch(base, 16, AdapterId(1), 0, None).unwrap();
        page_index.link_region(id, &[base as u64]);

        assert!(registry.unwatch(id));
        buf[0] = 42;

        let recorder = Arc::new(RecordingCallback {
            events: Mutex::new(Vec::new()),
        });
        *worker.callback.lock().unwrap() = Some(recorder.clone());

        let fault = PageFault {
            page_base: base as u64,
            fault_ip: 0,
            timestamp_ns: 1,
            seq: 1,
            thread_id: 1,
            _pad: 0,
        };
        worker.process_fault(&fault, 1);
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_callback_is_isolated_and_counted() {
        struct PanicCallback;
        impl ChangeCallback for PanicCallback {
            fn on_change(&self, _event: &ChangeEvent) {
                panic!("adapter callback exploded");
            }
        }
        let (worker, registry, _) = build_worker(4096);
        let mut buf = *b"Hello, World!";
        let (_, region) = registry
            .watch(buf.as_mut_ptr() as usize, buf.len(), AdapterId(1), 0, None)
            .unwrap();
        buf[0] = b'J';
        *worker.callback.lock().unwrap() = Some(Arc::new(PanicCallback));

        worker.rehash_and_maybe_emit(&region, None, None, 1);
        assert_eq!(worker.stats.snapshot().callback_errors, 1);
    }
}
