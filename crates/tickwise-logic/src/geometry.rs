//! Plain spatial types shared by the scheduler and the lookup caches.
//!
//! Positions are continuous `f64` world coordinates; cells are the integer
//! grid the lookup caches key on, and regions are fixed-size groups of cells
//! that the host loads and unloads as a unit.

use serde::{Deserialize, Serialize};

/// Number of cells along each horizontal edge of a region.
pub const REGION_SIZE: i32 = 16;

/// A point in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Squared Euclidean distance to `other`.
    pub fn distance_squared(&self, other: &Vec3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    /// Linear blend towards `other`; `t` is not clamped here.
    pub fn lerp(&self, other: &Vec3, t: f64) -> Vec3 {
        Vec3 {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
            z: self.z + (other.z - self.z) * t,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Integer grid cell containing a world position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The cell containing `pos` (floor on each axis, saturating).
    pub fn containing(pos: &Vec3) -> Self {
        Self {
            x: pos.x.floor() as i32,
            y: pos.y.floor() as i32,
            z: pos.z.floor() as i32,
        }
    }

    /// The region this cell belongs to.
    pub fn region(&self) -> RegionPos {
        RegionPos {
            x: self.x.div_euclid(REGION_SIZE),
            z: self.z.div_euclid(REGION_SIZE),
        }
    }
}

/// A column of cells loaded and unloaded together by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn contains(&self, cell: &CellPos) -> bool {
        cell.region() == *self
    }
}

/// Interpolate between two angles in degrees along the shorter arc.
///
/// The result is not normalized; callers that need `[-180, 180)` should wrap
/// it themselves.
pub fn lerp_angle_degrees(from: f32, to: f32, t: f32) -> f32 {
    from + wrap_degrees(to - from) * t
}

/// Wrap an angle difference into `[-180, 180)`.
pub fn wrap_degrees(angle: f32) -> f32 {
    let wrapped = (angle + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped.is_finite() {
        wrapped
    } else {
        0.0
    }
}
