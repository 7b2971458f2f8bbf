//! Monotonic nanosecond timestamps.
//!
//! Two entry points: [`now_ns`] for ordinary code (worker, throttle
//! controller, poll adapter), and [`now_ns_signal_safe`] for use inside the
//! fault handler, where only a direct `clock_gettime(2)` syscall is
//! permitted — no going through an allocator or a runtime.

use nix::time::{clock_gettime, ClockId};

/// Monotonic timestamp for non-signal-handler contexts.
pub fn now_ns() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}

/// Monotonic timestamp safe to call from an async-signal context: a bare
/// `libc::clock_gettime`, no allocation, no `Result`-wrapping indirection
/// that could panic.
///
/// # Safety
/// Must only be called where async-signal-safety is actually required
/// (i.e. from within the installed fault handler). It is safe to call from
/// ordinary code too, just unnecessary.
pub fn now_ns_signal_safe() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ns_is_increasing() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn signal_safe_variant_agrees_with_nix_variant() {
        let a = now_ns_signal_safe();
        let b = now_ns();
        // both monotonic clocks, should be within a second of each other
        assert!(b >= a);
        assert!(b - a < 1_000_000_000);
    }
}
