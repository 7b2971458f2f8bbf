//! Tunable constants, with sensible defaults and an optional TOML-file
//! override for hosts that want one.
//!
//! These are deliberately not part of the stable ABI — they're documented
//! defaults a compiled-in implementation could hardcode; `CoreConfig` is
//! the Rust-native knob a host passes to [`crate::Core::init`] instead. The
//! TOML loader is a convenience layered on top, the same shape as the
//! config file a deployed daemon would read.

use serde::Deserialize;
use std::fs;
use std::path::Path;

const ENV_CONFIG_PATH: &str = "MEMWATCH_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Ring capacity, in slots. Must be a power of two.
    pub ring_capacity: u32,
    /// Writable window after a fault, in milliseconds, before the worker
    /// re-protects a page.
    pub writable_window_ms: u64,
    /// Regions at or below this size get their full value inlined in
    /// `ChangeEvent` instead of a large-value storage key.
    pub small_threshold: usize,
    /// Bytes of `old_preview`/`new_preview` always included in an event.
    pub preview_size: usize,
    /// Fault rate (faults/sec) above which a page is demoted from
    /// fault-driven to polling mode.
    pub throttle_threshold_hz: f64,
    /// How long a polling-mode page must stay quiescent before it is
    /// promoted back to fault-driven mode.
    pub throttle_cooldown_ms: u64,
    /// Rescan cadence for a page in polling (throttled) mode.
    pub hot_page_poll_interval_ms: u64,
    /// Rescan cadence for the global poll adapter fallback.
    pub fallback_poll_interval_ms: u64,
    /// Worker idle sleep when the ring has nothing to drain.
    pub worker_idle_sleep_ms: u64,
    /// Soft timeout for a registered resolver before its event ships with a
    /// partially-filled `where`.
    pub resolver_timeout_ms: u64,
    /// Upper bound on simultaneously tracked regions.
    pub max_regions: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ring_capacity: memwatch_common::RING_CAPACITY,
            writable_window_ms: 5,
            small_threshold: 4096,
            preview_size: 256,
            throttle_threshold_hz: 100.0,
            throttle_cooldown_ms: 10_000,
            hot_page_poll_interval_ms: 10,
            fallback_poll_interval_ms: 100,
            worker_idle_sleep_ms: 1,
            resolver_timeout_ms: 5,
            max_regions: 1 << 20,
        }
    }
}

impl CoreConfig {
    /// Load overrides from a TOML file. The path can be set with the
    /// `MEMWATCH_CONFIG` environment variable; falls back to the file at
    /// `default_path` if the variable is unset. Any read or parse failure
    /// yields [`CoreConfig::default`] rather than an error — a watcher
    /// should never fail to start because its tuning file is missing.
    pub fn load_with_default_path(default_path: &str) -> Self {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| default_path.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), crate::error::InitError> {
        if !self.ring_capacity.is_power_of_two() {
            return Err(crate::error::InitError::InvalidConfig(
                "ring_capacity must be a power of two",
            ));
        }
        if self.small_threshold == 0 {
            return Err(crate::error::InitError::InvalidConfig(
                "small_threshold must be > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.ring_capacity, 65_536);
        assert_eq!(cfg.writable_window_ms, 5);
        assert_eq!(cfg.small_threshold, 4096);
        assert_eq!(cfg.preview_size, 256);
        assert_eq!(cfg.throttle_threshold_hz, 100.0);
        assert_eq!(cfg.throttle_cooldown_ms, 10_000);
        assert_eq!(cfg.hot_page_poll_interval_ms, 10);
        assert_eq!(cfg.fallback_poll_interval_ms, 100);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = CoreConfig::load_from(Path::new("/nonexistent/memwatch.toml"));
        assert_eq!(cfg.ring_capacity, CoreConfig::default().ring_capacity);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "writable_window_ms = 20").unwrap();
        let cfg = CoreConfig::load_from(file.path());
        assert_eq!(cfg.writable_window_ms, 20);
        assert_eq!(cfg.ring_capacity, CoreConfig::default().ring_capacity);
    }

    #[test]
    fn rejects_non_power_of_two_ring_capacity() {
        let cfg = CoreConfig {
            ring_capacity: 100,
            ..CoreConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
