//! Async-signal-safe fault handler.
//!
//! Everything reachable from [`trampoline`] must stick to: atomic
//! load/store/CAS, reads of preallocated memory, the page-protection
//! syscall (documented async-signal-safe on Linux/macOS), and
//! `clock_gettime`. No allocation, no locks, no host-runtime calls, no
//! stdio — see [`crate::clock::now_ns_signal_safe`] and [`ProtectedPageSet`].
//!
//! One necessary exception to "no global state" elsewhere in this crate:
//! the OS signal API has no per-registration context pointer, so the
//! active core's handler-relevant state must live behind a single
//! process-wide atomic pointer. Everything else is reached through the
//! `Core` value; only this one pointer is process-global, and only for as
//! long as a `Core` is installed — one core instance watches one
//! process's address space.

use memwatch_common::{PageFault, RegionId};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::ring::Ring;

/// Lock-free, insert/remove/contains set of page-base addresses, consulted
/// by the signal handler to decide in O(1) whether a fault is ours to
/// trap. Populated/depopulated by the registry on `watch`/`unwatch`,
/// outside signal context — a linear-probed open-addressed table sized for
/// exactly the handler-safe membership check it needs to answer.
pub struct ProtectedPageSet {
    slots: Box<[AtomicU64]>,
    mask: u64,
}

const EMPTY: u64 = 0;
const TOMBSTONE: u64 = u64::MAX;

impl ProtectedPageSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(64);
        let slots = (0..capacity).map(|_| AtomicU64::new(EMPTY)).collect();
        Self {
            slots,
            mask: (capacity - 1) as u64,
        }
    }

    fn encode(page_base: u64) -> u64 {
        // page_base is always page-aligned and non-zero in practice (no
        // region ever covers address 0); EMPTY/TOMBSTONE are safe sentinels.
        page_base
    }

    /// Safe to call from ordinary (non-signal) context only.
    pub fn insert(&self, page_base: u64) {
        let key = Self::encode(page_base);
        let mut idx = (key.wrapping_mul(0x9E3779B97F4A7C15)) & self.mask;
        loop {
            let cur = self.slots[idx as usize].load(Ordering::Relaxed);
            if cur == key {
                return;
            }
            if cur == EMPTY || cur == TOMBSTONE {
                if self.slots[idx as usize]
                    .compare_exchange(cur, key, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            idx = (idx + 1) & self.mask;
        }
    }

    /// Safe to call from ordinary (non-signal) context only.
    pub fn remove(&self, page_base: u64) {
        let key = Self::encode(page_base);
        let mut idx = (key.wrapping_mul(0x9E3779B97F4A7C15)) & self.mask;
        let start = idx;
        loop {
            let cur = self.slots[idx as usize].load(Ordering::Relaxed);
            if cur == key {
                self.slots[idx as usize].store(TOMBSTONE, Ordering::Release);
                return;
            }
            if cur == EMPTY {
                return;
            }
            idx = (idx + 1) & self.mask;
            if idx == start {
                return;
            }
        }
    }

    /// Async-signal-safe: atomic loads only, bounded probe sequence.
    pub fn contains(&self, page_base: u64) -> bool {
        let key = Self::encode(page_base);
        let mut idx = (key.wrapping_mul(0x9E3779B97F4A7C15)) & self.mask;
        let start = idx;
        loop {
            let cur = self.slots[idx as usize].load(Ordering::Acquire);
            if cur == key {
                return true;
            }
            if cur == EMPTY {
                return false;
            }
            idx = (idx + 1) & self.mask;
            if idx == start {
                return false;
            }
        }
    }
}

/// Process-wide state the trampoline needs. Lives as long as a `Core` has
/// the handler installed.
pub struct HandlerState {
    pub ring: *const Ring,
    pub protected_pages: *const ProtectedPageSet,
    pub dropped_events: *const std::sync::atomic::AtomicU64,
    pub faults_observed: *const std::sync::atomic::AtomicU64,
    pub page_size: usize,
    pub prev_action: libc::sigaction,
}

unsafe impl Send for HandlerState {}
unsafe impl Sync for HandlerState {}

static ACTIVE: AtomicPtr<HandlerState> = AtomicPtr::new(std::ptr::null_mut());

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("a fault handler is already installed in this process")]
    AlreadyInstalled,
    #[error("sigaction(2) failed")]
    SigactionFailed,
}

/// Install the SIGSEGV trampoline. Only one may be installed per process.
///
/// # Safety
/// `ring`, `protected_pages`, `dropped_events`, and `faults_observed` must
/// outlive the handler (i.e. the caller must call [`uninstall`] before
/// dropping them).
pub unsafe fn install(
    ring: &Ring,
    protected_pages: &ProtectedPageSet,
    dropped_events: &std::sync::atomic::AtomicU64,
    faults_observed: &std::sync::atomic::AtomicU64,
    page_size: usize,
) -> Result<(), InstallError> {
    if !ACTIVE.load(Ordering::Acquire).is_null() {
        return Err(InstallError::AlreadyInstalled);
    }

    let mut state = Box::new(HandlerState {
        ring: ring as *const Ring,
        protected_pages: protected_pages as *const ProtectedPageSet,
        dropped_events: dropped_events as *const _,
        faults_observed: faults_observed as *const _,
        page_size,
        prev_action: std::mem::zeroed(),
    });

    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = trampoline as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);

    let rc = libc::sigaction(libc::SIGSEGV, &action, &mut state.prev_action);
    if rc != 0 {
        return Err(InstallError::SigactionFailed);
    }

    let raw = Box::into_raw(state);
    ACTIVE.store(raw, Ordering::Release);
    Ok(())
}

/// Restore whatever handler was installed before ours.
///
/// # Safety
/// Must only be called after [`install`] succeeded, and must be the only
/// uninstall in flight.
pub unsafe fn uninstall() {
    let raw = ACTIVE.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if raw.is_null() {
        return;
    }
    let state = Box::from_raw(raw);
    libc::sigaction(libc::SIGSEGV, &state.prev_action, std::ptr::null_mut());
}

/// Extract the faulting instruction pointer from the machine context the OS
/// hands the handler. This is the source of truth for `fault_ip` — not
/// `si_addr` (the data address the fault occurred on) and not a
/// return-address builtin, which would point into the trampoline itself.
#[cfg(target_arch = "x86_64")]
unsafe fn instruction_pointer(ctx: *mut libc::c_void) -> u64 {
    let ucontext = ctx as *mut libc::ucontext_t;
    (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as u64
}

#[cfg(target_arch = "aarch64")]
unsafe fn instruction_pointer(ctx: *mut libc::c_void) -> u64 {
    let ucontext = ctx as *mut libc::ucontext_t;
    (*ucontext).uc_mcontext.pc as u64
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn instruction_pointer(_ctx: *mut libc::c_void) -> u64 {
    0
}

/// The installed `SA_SIGINFO` handler. Async-signal-safe by construction:
/// see module docs for the permitted operation set.
extern "C" fn trampoline(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    unsafe {
        let state_ptr = ACTIVE.load(Ordering::Acquire);
        if state_ptr.is_null() {
            chain_to_default(sig, info, ctx);
            return;
        }
        let state = &*state_ptr;

        let fault_addr = (*info).si_addr() as usize;
        let page_base = (fault_addr & !(state.page_size - 1)) as u64;

        if !(*state.protected_pages).contains(page_base) {
            // Not one of ours: a genuine segfault. Chain to whatever was
            // installed before us so the process still terminates.
            chain_to_previous(state, sig, info, ctx);
            return;
        }

        let faults_observed = &*state.faults_observed;
        faults_observed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let ring = &*state.ring;
        let seq = ring.next_seq();
        let timestamp_ns = crate::clock::now_ns_signal_safe();
        let fault_ip = instruction_pointer(ctx);
        let thread_id = libc::syscall(libc::SYS_gettid) as u32;

        let record = PageFault {
            page_base,
            fault_ip,
            timestamp_ns,
            seq,
            thread_id,
            _pad: 0,
        };

        if ring.try_publish(record).is_err() {
            let dropped = &*state.dropped_events;
            dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        // Lift write-protection on this page so the retried store
        // completes. The worker re-protects after the writable window.
        let _ = crate::protect::protect_read_write(page_base as usize, state.page_size);
    }
}

unsafe fn chain_to_previous(
    state: &HandlerState,
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let prev = &state.prev_action;
    if prev.sa_sigaction == libc::SIG_DFL || prev.sa_sigaction == libc::SIG_IGN {
        libc::sigaction(sig, prev, std::ptr::null_mut());
        return;
    }
    if prev.sa_flags & libc::SA_SIGINFO != 0 {
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            std::mem::transmute(prev.sa_sigaction);
        handler(sig, info, ctx);
    } else {
        let handler: extern "C" fn(libc::c_int) = std::mem::transmute(prev.sa_sigaction);
        handler(sig);
    }
}

unsafe fn chain_to_default(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = libc::SIG_DFL;
    libc::sigaction(sig, &action, std::ptr::null_mut());
    let _ = (info, ctx);
    libc::raise(sig);
}

/// Exposed for the worker and page index to look up which region list a
/// fault's page maps to without re-deriving `page_base` arithmetic.
pub fn region_ids_for_fault(page_index: &crate::page_index::PageIndex, fault: &PageFault) -> Vec<RegionId> {
    page_index.regions_for_page(fault.page_base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_page_set_insert_contains_remove() {
        let set = ProtectedPageSet::new(64);
        assert!(!set.contains(4096));
        set.insert(4096);
        assert!(set.contains(4096));
        set.remove(4096);
        assert!(!set.contains(4096));
    }

    #[test]
    fn protected_page_set_handles_collisions() {
        let set = ProtectedPageSet::new(8);
        for i in 0..6u64 {
            set.insert((i + 1) * 4096);
        }
        for i in 0..6u64 {
            assert!(set.contains((i + 1) * 4096));
        }
    }

    #[test]
    fn unrelated_page_is_not_contained() {
        let set = ProtectedPageSet::new(64);
        set.insert(4096);
        assert!(!set.contains(8192));
    }
}
