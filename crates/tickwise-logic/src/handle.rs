//! Generational object handles.
//!
//! The host owns its objects; this crate only keys per-object state by a
//! slot index. The generation half of the handle lets the scheduler and the
//! motion cache tell a recycled slot apart from the object that used it
//! before, so state left behind by a missed `remove` is never inherited.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier for a trackable dynamic object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHandle {
    index: u32,
    generation: u32,
}

impl ObjectHandle {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Handle for hosts that never recycle ids.
    pub const fn from_index(index: u32) -> Self {
        Self::new(index, 0)
    }

    /// Decode a packed `generation << 32 | index` value, the layout used by
    /// generational ECS entity ids.
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }

    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Phase offset within an update interval.
    ///
    /// Deterministic in the slot index so objects sharing a tier spread
    /// their full updates across the interval instead of all landing on the
    /// same step.
    pub fn stable_phase(self, interval: u32) -> u64 {
        u64::from(self.index % interval.max(1))
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}
