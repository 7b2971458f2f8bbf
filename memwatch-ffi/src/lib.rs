//! Stable `extern "C"` surface over `memwatch-core`, for per-language
//! adapters that cannot or do not want to link Rust directly. Covers the
//! full lifecycle: `init`, `shutdown`, `watch`, `unwatch`, `set_callback`,
//! `check_changes`, `get_stats`, `register_resolver`.
//!
//! Every function here is a thin, panic-guarded shim around the safe Rust
//! API in `memwatch_core::Core` — no logic lives in this crate beyond type
//! conversion across the FFI boundary.

mod event;

use std::os::raw::c_char;
use std::sync::{Arc, Mutex};

use memwatch_common::{AdapterId, RegionId};
use memwatch_core::{ChangeCallback, ChangeEvent, Core, CoreConfig, Location, Resolver, StatsSnapshot};

pub use event::{CBytes, CChangeEvent, CWhere};

/// Opaque handle returned by [`memwatch_init`]. Callers treat this as a
/// pointer they pass back unmodified; the layout is not part of the ABI.
pub struct MemwatchCore {
    core: Core,
    /// Backing store for the most recent [`memwatch_check_changes`] batch.
    /// The `CBytes` pointers written into that call's `out_events` borrow
    /// from here, so this must outlive the call. It's overwritten (not
    /// freed) by the next `memwatch_check_changes` call, and dropped on
    /// `memwatch_shutdown`.
    last_check_changes_batch: Mutex<Vec<ChangeEvent>>,
}

/// Install `env_logger` as the process-wide `log` backend. Optional: a host
/// that already configured `log` itself (e.g. an embedding Rust process)
/// should skip this; a pure-C host has nowhere else to do it. Safe to call
/// more than once — later calls are no-ops.
#[no_mangle]
pub extern "C" fn memwatch_init_logging() {
    let _ = env_logger::try_init();
}

fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(ptr) };
    Some(cstr.to_string_lossy().into_owned())
}

/// Create and start a watcher with default tuning. Returns null on failure
/// (invalid config or fault-handler install failure); check `errno`-style
/// diagnostics via the process log rather than a return code — no panic
/// ever crosses this boundary.
#[no_mangle]
pub unsafe extern "C" fn memwatch_init() -> *mut MemwatchCore {
    let result = std::panic::catch_unwind(|| Core::init(CoreConfig::default()));
    match result {
        Ok(Ok(core)) => Box::into_raw(Box::new(MemwatchCore {
            core,
            last_check_changes_batch: Mutex::new(Vec::new()),
        })),
        Ok(Err(err)) => {
            log::error!("memwatch_init failed: {err}");
            std::ptr::null_mut()
        }
        Err(_) => {
            log::error!("memwatch_init panicked");
            std::ptr::null_mut()
        }
    }
}

/// Tear down a watcher created by [`memwatch_init`]. `handle` must not be
/// used again after this call; passing null is a no-op.
#[no_mangle]
pub unsafe extern "C" fn memwatch_shutdown(handle: *mut MemwatchCore) {
    if handle.is_null() {
        return;
    }
    let boxed = Box::from_raw(handle);
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| boxed.core.shutdown()));
}

/// Start watching `[addr, addr+size)`. `name` may be null. Returns
/// `RegionId::INVALID` (0) on any error.
#[no_mangle]
pub unsafe extern "C" fn memwatch_watch(
    handle: *mut MemwatchCore,
    addr: usize,
    size: usize,
    name: *const c_char,
    adapter_id: u16,
    metadata_ref: u64,
) -> u32 {
    if handle.is_null() {
        return RegionId::INVALID.0;
    }
    let core = &(*handle).core;
    let name = cstr_to_string(name);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        core.watch(addr, size, name, AdapterId(adapter_id), metadata_ref)
    }));
    match result {
        Ok(Ok(id)) => id.0,
        Ok(Err(err)) => {
            log::warn!("memwatch_watch rejected: {err}");
            RegionId::INVALID.0
        }
        Err(_) => {
            log::error!("memwatch_watch panicked");
            RegionId::INVALID.0
        }
    }
}

/// Stop watching a region previously returned by [`memwatch_watch`].
/// Returns `true` if the region was live and is now removed.
#[no_mangle]
pub unsafe extern "C" fn memwatch_unwatch(handle: *mut MemwatchCore, region_id: u32) -> bool {
    if handle.is_null() {
        return false;
    }
    let core = &(*handle).core;
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| core.unwatch(RegionId(region_id))))
        .unwrap_or(false)
}

/// Function pointer a caller registers to receive events as they are
/// delivered. `event` and everything it points to is valid only for the
/// duration of the call — the callee must copy out anything it wants to
/// keep.
pub type MemwatchCallback = unsafe extern "C" fn(event: *const CChangeEvent, user_ctx: *mut std::ffi::c_void);

struct FfiCallback {
    func: MemwatchCallback,
    // Raw pointers aren't `Send`/`Sync` by default; the caller is
    // contractually responsible for `user_ctx`'s thread-safety, same as
    // any other C callback API.
    ctx: SendPtr,
}

#[derive(Clone, Copy)]
struct SendPtr(*mut std::ffi::c_void);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl ChangeCallback for FfiCallback {
    fn on_change(&self, event: &ChangeEvent) {
        let c_event = CChangeEvent::from_event(event);
        unsafe {
            (self.func)(&c_event as *const CChangeEvent, self.ctx.0);
        }
    }
}

/// Register (or clear, with `callback = None`) the process-wide callback.
/// Pass a null function pointer to clear.
#[no_mangle]
pub unsafe extern "C" fn memwatch_set_callback(
    handle: *mut MemwatchCore,
    callback: Option<MemwatchCallback>,
    user_ctx: *mut std::ffi::c_void,
) {
    if handle.is_null() {
        return;
    }
    let core = &(*handle).core;
    let cb: Option<Arc<dyn ChangeCallback>> = callback.map(|func| {
        Arc::new(FfiCallback {
            func,
            ctx: SendPtr(user_ctx),
        }) as Arc<dyn ChangeCallback>
    });
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| core.set_callback(cb)));
}

/// Source-location metadata a resolver fills in for a given fault
/// instruction pointer. `file`/`function` are borrowed, null-terminated,
/// and only valid for the duration of the resolver call; `line == -1`
/// means unknown.
#[repr(C)]
pub struct CLocation {
    pub file: *const c_char,
    pub function: *const c_char,
    pub line: i64,
}

/// Resolver function an adapter registers per `adapter_id`. Must fill
/// `out` and return `true` on success, or return `false` to signal "no
/// location available".
pub type MemwatchResolverFn =
    unsafe extern "C" fn(fault_ip: u64, user_ctx: *mut std::ffi::c_void, out: *mut CLocation) -> bool;

struct FfiResolver {
    func: MemwatchResolverFn,
    ctx: SendPtr,
}

impl Resolver for FfiResolver {
    fn resolve(&self, fault_ip: u64) -> Option<Location> {
        let mut out = CLocation {
            file: std::ptr::null(),
            function: std::ptr::null(),
            line: -1,
        };
        let ok = unsafe { (self.func)(fault_ip, self.ctx.0, &mut out as *mut CLocation) };
        if !ok {
            return None;
        }
        Some(Location {
            file: cstr_to_string(out.file),
            function: cstr_to_string(out.function),
            line: if out.line >= 0 { Some(out.line as u32) } else { None },
        })
    }
}

/// Register a resolver for `adapter_id`. A later call for the same
/// `adapter_id` replaces the previous registration.
#[no_mangle]
pub unsafe extern "C" fn memwatch_register_resolver(
    handle: *mut MemwatchCore,
    adapter_id: u16,
    resolver: MemwatchResolverFn,
    user_ctx: *mut std::ffi::c_void,
) {
    if handle.is_null() {
        return;
    }
    let core = &(*handle).core;
    let resolver = Arc::new(FfiResolver {
        func: resolver,
        ctx: SendPtr(user_ctx),
    });
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        core.register_resolver(AdapterId(adapter_id), resolver)
    }));
}

/// Remove any resolver registered for `adapter_id`.
#[no_mangle]
pub unsafe extern "C" fn memwatch_unregister_resolver(handle: *mut MemwatchCore, adapter_id: u16) {
    if handle.is_null() {
        return;
    }
    let core = &(*handle).core;
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        core.unregister_resolver(AdapterId(adapter_id))
    }));
}

/// Drain up to `max` pending events into `out_events` (a caller-allocated
/// array of at least `max` elements). Returns the number actually written.
/// Polling-mode convenience alternative to [`memwatch_set_callback`].
///
/// Unlike [`memwatch_set_callback`]'s event (valid only for the duration of
/// the callback), the `CBytes` pointers written into `out_events` here
/// borrow from a batch retained on `handle`: they stay valid until the
/// *next* call to `memwatch_check_changes` on the same handle, or until
/// `memwatch_shutdown`. Copy out anything that needs to outlive that.
#[no_mangle]
pub unsafe extern "C" fn memwatch_check_changes(
    handle: *mut MemwatchCore,
    out_events: *mut CChangeEvent,
    max: usize,
) -> usize {
    if handle.is_null() || out_events.is_null() || max == 0 {
        return 0;
    }
    let handle = &*handle;
    let core = &handle.core;
    let events = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| core.check_changes(max))) {
        Ok(events) => events,
        Err(_) => {
            log::error!("memwatch_check_changes panicked");
            return 0;
        }
    };

    let mut batch = handle.last_check_changes_batch.lock().unwrap();
    *batch = events;
    let n = batch.len();
    for (i, event) in batch.iter().enumerate() {
        std::ptr::write(out_events.add(i), CChangeEvent::from_event(event));
    }
    n
}

/// Snapshot of the stats block. Already `#[repr(C)]` in `memwatch-core`;
/// re-exported here so C callers don't need to depend on that crate
/// directly.
pub type CStats = StatsSnapshot;

/// Fill `out` with a snapshot of the current stats. Returns `false` (and
/// leaves `out` untouched) if `handle` is null.
#[no_mangle]
pub unsafe extern "C" fn memwatch_get_stats(handle: *mut MemwatchCore, out: *mut CStats) -> bool {
    if handle.is_null() || out.is_null() {
        return false;
    }
    let core = &(*handle).core;
    let snapshot = core.get_stats();
    std::ptr::write(out, snapshot);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    // `Core::init` installs a single process-wide fault handler; serialize
    // tests that call it instead of relying on `cargo test`'s parallelism.
    fn core_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn init_watch_unwatch_shutdown_round_trips() {
        let _guard = core_lock().lock().unwrap();
        unsafe {
            let handle = memwatch_init();
            assert!(!handle.is_null());

            let mut buf = *b"Hello, World!";
            let region_id = memwatch_watch(
                handle,
                buf.as_mut_ptr() as usize,
                buf.len(),
                std::ptr::null(),
                1,
                0,
            );
            assert_ne!(region_id, 0);
            assert!(memwatch_unwatch(handle, region_id));
            assert!(!memwatch_unwatch(handle, region_id));

            memwatch_shutdown(handle);
        }
    }

    #[test]
    fn null_handle_calls_are_harmless() {
        unsafe {
            assert_eq!(memwatch_watch(std::ptr::null_mut(), 0, 0, std::ptr::null(), 0, 0), 0);
            assert!(!memwatch_unwatch(std::ptr::null_mut(), 1));
            let mut stats = std::mem::MaybeUninit::<CStats>::uninit();
            assert!(!memwatch_get_stats(std::ptr::null_mut(), stats.as_mut_ptr()));
            memwatch_shutdown(std::ptr::null_mut());
        }
    }

    #[test]
    fn get_stats_reports_ring_capacity() {
        let _guard = core_lock().lock().unwrap();
        unsafe {
            let handle = memwatch_init();
            let mut stats = std::mem::MaybeUninit::<CStats>::uninit();
            assert!(memwatch_get_stats(handle, stats.as_mut_ptr()));
            let stats = stats.assume_init();
            assert_eq!(stats.ring_capacity, CoreConfig::default().ring_capacity as u64);
            memwatch_shutdown(handle);
        }
    }

    #[test]
    fn check_changes_bytes_survive_past_the_call_until_the_next_one() {
        let _guard = core_lock().lock().unwrap();
        unsafe {
            let handle = memwatch_init();
            let mut buf = *b"Hello, World!";
            let region_id = memwatch_watch(
                handle,
                buf.as_mut_ptr() as usize,
                buf.len(),
                std::ptr::null(),
                1,
                0,
            );
            assert_ne!(region_id, 0);
            buf[0] = b'J';

            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
            let mut out = std::mem::MaybeUninit::<CChangeEvent>::uninit();
            let mut n = 0;
            while std::time::Instant::now() < deadline {
                n = memwatch_check_changes(handle, out.as_mut_ptr(), 1);
                if n > 0 {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            assert_eq!(n, 1);
            let event = out.assume_init();
            assert!(!event.new_value.ptr.is_null());
            let new_value = std::slice::from_raw_parts(event.new_value.ptr, event.new_value.len);
            assert_eq!(new_value, b"Jello, World!");

            // A second call with nothing pending must not invalidate the
            // previous read mid-use; only reading `new_value` *after* this
            // call would be unsound.
            let mut out2 = std::mem::MaybeUninit::<CChangeEvent>::uninit();
            let n2 = memwatch_check_changes(handle, out2.as_mut_ptr(), 1);
            assert_eq!(n2, 0);

            memwatch_shutdown(handle);
        }
    }
}
