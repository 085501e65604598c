//! Cell addressing.
//!
//! Every backend partitions map-frame space into axis-aligned cubes of edge
//! `resolution`.  A point belongs to the cell whose integer key is
//! `floor(p / resolution)` per axis, so a cell with key `k` spans the
//! half-open box `[k·r, (k+1)·r)`.
//!
//! Keys are limited to `[-KEY_LIMIT, KEY_LIMIT)` per axis.  Points outside
//! that extent are not addressable, which bounds the number of cells a
//! single ray can touch.
//!
//! | Type | Role |
//! |------|------|
//! | [`VoxelKey`] | Integer cell coordinate.                        |
//! | [`Aabb`]     | An axis-aligned bounding box in map coordinates. |

use fusemap_types::Point3;
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// VoxelKey
// ────────────────────────────────────────────────────────────────────────────

/// Cell indices per axis on each side of the map origin.
pub const KEY_LIMIT: i32 = 1 << 15;

/// Integer coordinate of a map cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoxelKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelKey {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Key of the cell containing `p`.
    ///
    /// Returns `None` for non-finite points and for points whose cell index
    /// falls outside `[-KEY_LIMIT, KEY_LIMIT)` on any axis.
    pub fn from_point(p: Point3, resolution: f64) -> Option<Self> {
        let limit = KEY_LIMIT as f64;
        let axis = |v: f64| {
            let k = (v / resolution).floor();
            (k.is_finite() && k >= -limit && k < limit).then_some(k as i32)
        };
        Some(Self::new(axis(p.x)?, axis(p.y)?, axis(p.z)?))
    }

    /// Centre of the cell in map coordinates.
    pub fn centre(self, resolution: f64) -> Point3 {
        Point3::new(
            (self.x as f64 + 0.5) * resolution,
            (self.y as f64 + 0.5) * resolution,
            (self.z as f64 + 0.5) * resolution,
        )
    }

    /// Spatial extent of the cell.
    pub fn bounds(self, resolution: f64) -> Aabb {
        let min = Point3::new(
            self.x as f64 * resolution,
            self.y as f64 * resolution,
            self.z as f64 * resolution,
        );
        Aabb::new(min, min.add(Point3::new(resolution, resolution, resolution)))
    }

    /// Number of single-axis steps between two keys.
    pub fn manhattan(self, other: Self) -> u64 {
        (self.x as i64 - other.x as i64).unsigned_abs()
            + (self.y as i64 - other.y as i64).unsigned_abs()
            + (self.z as i64 - other.z as i64).unsigned_abs()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Aabb
// ────────────────────────────────────────────────────────────────────────────

/// An axis-aligned bounding box, defined by its minimum and maximum corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Point3,
    pub max: Point3,
}

impl Aabb {
    /// Create a bounding box from its two opposite corners.
    ///
    /// The constructor normalises the corners so that `min ≤ max` per axis.
    pub fn new(a: Point3, b: Point3) -> Self {
        Self {
            min: Point3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Point3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Return the centre point of the box.
    pub fn centre(&self) -> Point3 {
        self.min.add(self.max).scale(0.5)
    }

    /// True when the point lies inside or on the boundary of the box.
    pub fn contains_point(&self, p: Point3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// True when `other` overlaps (intersects or touches) this box.
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// Smallest box containing both `self` and `other`.
    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: Point3::new(
                self.min.x.min(other.min.x),
                self.min.y.min(other.min.y),
                self.min.z.min(other.min.z),
            ),
            max: Point3::new(
                self.max.x.max(other.max.x),
                self.max.y.max(other.max.y),
                self.max.z.max(other.max.z),
            ),
        }
    }
}

/// Bounding box of a set of cells, or `None` when the set is empty.
pub fn bounds_of(keys: impl IntoIterator<Item = VoxelKey>, resolution: f64) -> Option<Aabb> {
    keys.into_iter()
        .map(|k| k.bounds(resolution))
        .reduce(|acc, b| acc.union(&b))
}
