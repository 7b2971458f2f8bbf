//! Thin wrapper over the `region` crate's cross-platform `mprotect`
//! equivalent, the same way a lazy-pages write-trapping handler wraps it
//! to toggle a page between read-only and read-write.

use region::Protection;

#[derive(Debug, thiserror::Error)]
#[error("failed to change page protection: {0}")]
pub struct ProtectError(#[from] region::Error);

pub fn page_size() -> usize {
    region::page::size()
}

/// Write-protect `len` bytes starting at `addr` (read-only: any write
/// traps). `addr` must be page-aligned.
pub fn protect_read_only(addr: usize, len: usize) -> Result<(), ProtectError> {
    unsafe { region::protect(addr as *const (), len, Protection::READ) }.map_err(ProtectError)
}

/// Lift write-protection on `len` bytes starting at `addr`, making them
/// OS-writable again. `addr` must be page-aligned.
pub fn protect_read_write(addr: usize, len: usize) -> Result<(), ProtectError> {
    unsafe { region::protect(addr as *const (), len, Protection::READ_WRITE) }
        .map_err(ProtectError)
}

/// Best-effort probe: can this platform/process actually mprotect its own
/// memory? Used at `init` to decide whether to run fault-driven or fall
/// back to poll-only mode globally.
pub fn protection_available() -> bool {
    let size = page_size();
    let Ok(mut probe) = region::alloc(size, Protection::READ_WRITE) else {
        return false;
    };
    let addr = probe.as_mut_ptr::<u8>() as usize;
    protect_read_only(addr, size).is_ok() && protect_read_write(addr, size).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_plausible() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn protection_probe_succeeds_on_a_normal_process() {
        assert!(protection_available());
    }
}
