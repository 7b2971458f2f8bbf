//! C-compatible mirror of `memwatch_core::ChangeEvent`. Built from pointers
//! into a Rust-owned event; the caller must not retain those pointers past
//! whatever this call's documented lifetime is (for `memwatch_set_callback`,
//! the duration of the callback; for `memwatch_check_changes`, until the
//! next call on the same handle).

use memwatch_core::{ChangeEvent, Where};

#[repr(C)]
pub struct CBytes {
    pub ptr: *const u8,
    pub len: usize,
}

impl CBytes {
    fn from_slice(bytes: &[u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }

    fn absent() -> Self {
        Self {
            ptr: std::ptr::null(),
            len: 0,
        }
    }

    fn from_option(bytes: &Option<Vec<u8>>) -> Self {
        match bytes {
            Some(b) => Self::from_slice(b),
            None => Self::absent(),
        }
    }

    fn from_opt_str(s: &Option<String>) -> Self {
        match s {
            Some(s) => Self::from_slice(s.as_bytes()),
            None => Self::absent(),
        }
    }
}

#[repr(C)]
pub struct CWhere {
    pub file: CBytes,
    pub function: CBytes,
    /// -1 if absent.
    pub line: i64,
    pub has_fault_ip: bool,
    pub fault_ip: u64,
    pub has_thread_id: bool,
    pub thread_id: u32,
}

impl CWhere {
    fn from_where(w: &Where) -> Self {
        Self {
            file: CBytes::from_opt_str(&w.file),
            function: CBytes::from_opt_str(&w.function),
            line: w.line.map(i64::from).unwrap_or(-1),
            has_fault_ip: w.fault_ip.is_some(),
            fault_ip: w.fault_ip.unwrap_or(0),
            has_thread_id: w.thread_id.is_some(),
            thread_id: w.thread_id.unwrap_or(0),
        }
    }
}

#[repr(C)]
pub struct CChangeEvent {
    pub seq: u64,
    pub timestamp_ns: u64,
    pub adapter_id: u16,
    pub region_id: u32,
    pub variable_name: CBytes,
    pub r#where: CWhere,
    pub how_big: usize,
    pub old_preview: CBytes,
    pub new_preview: CBytes,
    pub old_value: CBytes,
    pub new_value: CBytes,
    pub storage_key_old: CBytes,
    pub storage_key_new: CBytes,
    pub metadata_ref: u64,
}

impl CChangeEvent {
    pub fn from_event(event: &ChangeEvent) -> Self {
        Self {
            seq: event.seq,
            timestamp_ns: event.timestamp_ns,
            adapter_id: event.adapter_id.0,
            region_id: event.region_id.0,
            variable_name: CBytes::from_opt_str(&event.variable_name),
            r#where: CWhere::from_where(&event.r#where),
            how_big: event.how_big,
            old_preview: match &event.old_preview {
                Some(b) => CBytes::from_slice(b),
                None => CBytes::absent(),
            },
            new_preview: CBytes::from_slice(&event.new_preview),
            old_value: CBytes::from_option(&event.old_value),
            new_value: CBytes::from_option(&event.new_value),
            storage_key_old: CBytes::from_opt_str(&event.storage_key_old),
            storage_key_new: CBytes::from_opt_str(&event.storage_key_new),
            metadata_ref: event.metadata_ref,
        }
    }
}
