//! `ChangeEvent`, the materialized, user-facing record of a detected
//! change. Unlike `PageFault`, this is an ordinary owned Rust value — built
//! by the worker, never touched by the signal handler.

use memwatch_common::{AdapterId, RegionId};
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Where {
    pub file: Option<String>,
    pub function: Option<String>,
    pub line: Option<u32>,
    /// Null in poll-adapter mode, where there is no faulting instruction.
    pub fault_ip: Option<u64>,
    pub thread_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub timestamp_ns: u64,
    pub adapter_id: AdapterId,
    pub region_id: RegionId,
    pub variable_name: Option<String>,
    pub r#where: Where,
    pub how_big: usize,
    pub old_preview: Option<Vec<u8>>,
    pub new_preview: Vec<u8>,
    pub old_value: Option<Vec<u8>>,
    pub new_value: Option<Vec<u8>>,
    pub storage_key_old: Option<String>,
    pub storage_key_new: Option<String>,
    pub metadata_ref: u64,
}

impl ChangeEvent {
    /// Invariant check used by tests and debug assertions: exactly one of
    /// `{value, storage_key}` populated per side.
    pub fn has_consistent_value_fields(&self) -> bool {
        let old_ok = !(self.old_value.is_some() && self.storage_key_old.is_some());
        let new_ok = self.new_value.is_some() != self.storage_key_new.is_some();
        old_ok && new_ok
    }

    /// Serialize as one NDJSON line. A CLI front-end or adapter that wants
    /// to log events as JSON uses this instead of reaching into the fields
    /// directly.
    pub fn to_ndjson_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event() -> ChangeEvent {
        ChangeEvent {
            seq: 1,
            timestamp_ns: 0,
            adapter_id: AdapterId(1),
            region_id: RegionId(1),
            variable_name: None,
            r#where: Where::default(),
            how_big: 13,
            old_preview: None,
            new_preview: vec![0; 13],
            old_value: None,
            new_value: Some(vec![0; 13]),
            storage_key_old: None,
            storage_key_new: None,
            metadata_ref: 0,
        }
    }

    #[test]
    fn small_region_uses_inline_value() {
        let event = base_event();
        assert!(event.has_consistent_value_fields());
    }

    #[test]
    fn large_region_uses_storage_key_not_both() {
        let mut event = base_event();
        event.new_value = None;
        event.storage_key_new = Some("memwatch/1/1/1".into());
        assert!(event.has_consistent_value_fields());
    }

    #[test]
    fn both_value_and_key_is_inconsistent() {
        let mut event = base_event();
        event.storage_key_new = Some("memwatch/1/1/1".into());
        assert!(!event.has_consistent_value_fields());
    }

    #[test]
    fn ndjson_line_round_trips_through_serde_json() {
        let event = base_event();
        let line = event.to_ndjson_line().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["seq"], 1);
        assert_eq!(parsed["region_id"], 1);
    }
}
