//! Public API: init/shutdown, watch/unwatch, set_callback, get_stats,
//! register_resolver, check_changes.
//!
//! One explicit `Core` value owns all process state instead of a
//! lazily-initialized global. The one unavoidable exception is the fault
//! handler trampoline itself, which the OS signal API requires to be
//! reachable through a bare function pointer — see `fault::ACTIVE`.

use memwatch_common::{AdapterId, RegionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::CoreConfig;
use crate::error::{InitError, WatchError};
use crate::event::ChangeEvent;
use crate::fault::{self, ProtectedPageSet};
use crate::page_index::{pages_touched, PageIndex};
use crate::protect;
use crate::registry::Registry;
use crate::resolver::{Resolver, ResolverTable};
use crate::ring::Ring;
use crate::stats::{Stats, StatsSnapshot};
use crate::worker::{ChangeCallback, Worker};

pub struct Core {
    registry: Arc<Registry>,
    page_index: Arc<PageIndex>,
    protected_pages: Arc<ProtectedPageSet>,
    stats: Arc<Stats>,
    resolvers: Arc<ResolverTable>,
    callback: Arc<Mutex<Option<Arc<dyn ChangeCallback>>>>,
    worker: Arc<Worker>,
    worker_handle: Option<JoinHandle<()>>,
    hot_page_handle: Option<JoinHandle<()>>,
    fallback_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    page_size: usize,
    fault_driven: bool,
    config: CoreConfig,
}

impl Core {
    /// Bring up the watcher: allocate the ring, probe for page-protection
    /// support, install the fault handler if available (falling back to
    /// poll-only mode otherwise), and start the worker and poll threads.
    pub fn init(config: CoreConfig) -> Result<Self, InitError> {
        config.validate()?;

        let page_size = protect::page_size();
        let fault_driven = protect::protection_available();
        if !fault_driven {
            log::warn!("page protection unavailable on this platform; running in poll-only mode");
        }

        let registry = Arc::new(Registry::new(config.max_regions));
        let page_index = Arc::new(PageIndex::new());
        let ring = Arc::new(Ring::new(config.ring_capacity).map_err(|_| InitError::HandlerInstallFailed)?);
        let protected_pages = Arc::new(ProtectedPageSet::new(config.ring_capacity as usize));
        let stats = Arc::new(Stats::new(config.ring_capacity, page_size as u32));
        stats.set_page_protection_available(fault_driven);
        let resolvers = Arc::new(ResolverTable::new());
        let callback: Arc<Mutex<Option<Arc<dyn ChangeCallback>>>> = Arc::new(Mutex::new(None));
        let shutdown = Arc::new(AtomicBool::new(false));

        if fault_driven {
            unsafe {
                fault::install(
                    &ring,
                    &protected_pages,
                    stats.dropped_events_atomic(),
                    stats.faults_observed_atomic(),
                    page_size,
                )
                .map_err(|_| InitError::HandlerInstallFailed)?;
            }
        }

        let worker = Arc::new(Worker::new(
            registry.clone(),
            page_index.clone(),
            ring.clone(),
            protected_pages.clone(),
            stats.clone(),
            resolvers.clone(),
            callback.clone(),
            config.clone(),
            page_size,
            shutdown.clone(),
        ));

        let worker_handle = {
            let worker = worker.clone();
            Some(std::thread::spawn(move || worker.run()))
        };

        let hot_page_handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            let interval = config.hot_page_poll_interval_ms;
            Some(std::thread::spawn(move || {
                crate::poll::run_hot_page_loop(worker, shutdown, interval)
            }))
        };

        let fallback_handle = if !fault_driven {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            let interval = config.fallback_poll_interval_ms;
            Some(std::thread::spawn(move || {
                crate::poll::run_fallback_loop(worker, shutdown, interval)
            }))
        } else {
            None
        };

        Ok(Self {
            registry,
            page_index,
            protected_pages,
            stats,
            resolvers,
            callback,
            worker,
            worker_handle,
            hot_page_handle,
            fallback_handle,
            shutdown,
            page_size,
            fault_driven,
            config,
        })
    }

    pub fn watch(
        &self,
        addr: usize,
        size: usize,
        name: Option<String>,
        adapter_id: AdapterId,
        metadata_ref: u64,
    ) -> Result<RegionId, WatchError> {
        let (region_id, _region) = self
            .registry
            .watch(addr, size, adapter_id, metadata_ref, name)?;

        let pages = pages_touched(addr, size, self.page_size);
        self.page_index.link_region(region_id, &pages);

        if self.fault_driven {
            for &page in &pages {
                match protect::protect_read_only(page as usize, self.page_size) {
                    Ok(()) => self.protected_pages.insert(page),
                    Err(_) => {
                        self.stats.inc_mprotect_failures();
                        if let Some(region) = self.registry.get(region_id) {
                            region.set_mode(crate::registry::RegionMode::Polling);
                        }
                        self.page_index.with_page(page, |entry| {
                            entry.protected.store(false, Ordering::Release);
                        });
                    }
                }
            }
        }

        self.stats.set_tracked_regions(self.registry.live_count());
        Ok(region_id)
    }

    pub fn unwatch(&self, region_id: RegionId) -> bool {
        let Some(region) = self.registry.get(region_id) else {
            return false;
        };
        let addr = region.addr;
        let size = region.size;

        // Tombstone first: any fault or rescan racing with this unwatch
        // that hasn't yet reached the worker will be filtered there.
        let removed = self.registry.unwatch(region_id);
        if !removed {
            return false;
        }

        let pages = pages_touched(addr, size, self.page_size);
        let emptied = self.page_index.unlink_region(region_id, &pages);
        for page in emptied {
            self.protected_pages.remove(page);
            let _ = protect::protect_read_write(page as usize, self.page_size);
        }
        self.stats.set_tracked_regions(self.registry.live_count());
        true
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn ChangeCallback>>) {
        *self.callback.lock().unwrap() = callback;
    }

    pub fn register_resolver(&self, adapter_id: AdapterId, resolver: Arc<dyn Resolver>) {
        self.resolvers.register(adapter_id, resolver);
    }

    pub fn unregister_resolver(&self, adapter_id: AdapterId) {
        self.resolvers.unregister(adapter_id);
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Polling-mode convenience read, independent of whether a callback is
    /// registered.
    pub fn check_changes(&self, max: usize) -> Vec<ChangeEvent> {
        self.worker.check_changes(max)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn shutdown_inner(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return; // already shut down
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.hot_page_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.fallback_handle.take() {
            let _ = handle.join();
        }
        if self.fault_driven {
            unsafe {
                fault::uninstall();
            }
        }
    }

    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    // `Core::init` installs a single process-wide SIGSEGV handler, so these
    // tests can't run concurrently with each other (cargo test runs a
    // module's tests on multiple threads by default).
    fn core_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn init_then_shutdown_is_clean() {
        let _guard = core_lock().lock().unwrap();
        let core = Core::init(CoreConfig::default()).unwrap();
        drop(core);
    }

    #[test]
    fn watch_then_unwatch_round_trips() {
        let _guard = core_lock().lock().unwrap();
        let core = Core::init(CoreConfig::default()).unwrap();
        let mut buf = *b"Hello, World!";
        let region_id = core
            .watch(buf.as_mut_ptr() as usize, buf.len(), None, AdapterId(1), 0)
            .unwrap();
        assert!(region_id.is_valid());
        assert!(core.unwatch(region_id));
        assert!(!core.unwatch(region_id));
    }

    #[test]
    fn watch_rejects_zero_size_region() {
        let _guard = core_lock().lock().unwrap();
        let core = Core::init(CoreConfig::default()).unwrap();
        let buf = [0u8; 1];
        let err = core
            .watch(buf.as_ptr() as usize, 0, None, AdapterId(1), 0)
            .unwrap_err();
        assert_eq!(err, WatchError::InvalidArgument);
    }

    #[test]
    fn stats_reflect_tracked_region_count() {
        let _guard = core_lock().lock().unwrap();
        let core = Core::init(CoreConfig::default()).unwrap();
        let buf = [0u8; 16];
        let before = core.get_stats().tracked_regions;
        core.watch(buf.as_ptr() as usize, 16, None, AdapterId(1), 0)
            .unwrap();
        let after = core.get_stats().tracked_regions;
        assert_eq!(after, before + 1);
    }
}
