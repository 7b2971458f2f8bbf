use serde::Serialize;
use std::fmt;

/// Process-unique, monotonically assigned identifier for a `TrackedRegion`.
///
/// Never reused within a single core instance: the registry arena only
/// grows, it never recycles a freed slot's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct RegionId(pub u32);

impl RegionId {
    pub const INVALID: RegionId = RegionId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the FFI adapter that registered a region, and the resolver
/// dispatch table slot associated with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct AdapterId(pub u16);

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
