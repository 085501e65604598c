//! Ray-voxel traversal for free-space clearing.
//!
//! Uses the Amanatides & Woo DDA: the parametric distance to the next cell
//! boundary is tracked per axis and the ray always advances across the
//! nearest one, so every cell the segment passes through is visited exactly
//! once.
//!
//! [`RayKeys`] yields the cells from the origin cell up to, but **excluding**,
//! the endpoint cell.  Occupancy backends mark those cells free and the
//! endpoint cell occupied.

use fusemap_types::Point3;

use crate::voxel::VoxelKey;

/// Iterator over the cells crossed by the segment `origin → end`, excluding
/// the cell containing `end`.
#[derive(Debug, Clone)]
pub struct RayKeys {
    current: VoxelKey,
    end: VoxelKey,
    step: [i32; 3],
    /// Segment parameter (0 at origin, 1 at end) of the next boundary per axis.
    t_max: [f64; 3],
    /// Parameter increment between consecutive boundaries per axis.
    t_delta: [f64; 3],
    /// Upper bound on the remaining steps; guards against rounding drift.
    remaining: u64,
    done: bool,
}

impl RayKeys {
    /// Start a traversal.  Returns `None` when either endpoint has no valid
    /// cell key (non-finite or out of the addressable range).
    pub fn new(origin: Point3, end: Point3, resolution: f64) -> Option<Self> {
        let start = VoxelKey::from_point(origin, resolution)?;
        let end_key = VoxelKey::from_point(end, resolution)?;
        let dir = end.sub(origin);

        let mut step = [0i32; 3];
        let mut t_max = [f64::INFINITY; 3];
        let mut t_delta = [f64::INFINITY; 3];
        let axes = [
            (origin.x, dir.x, start.x),
            (origin.y, dir.y, start.y),
            (origin.z, dir.z, start.z),
        ];
        for (i, &(o, d, k)) in axes.iter().enumerate() {
            if d > 0.0 {
                step[i] = 1;
                t_max[i] = ((k as f64 + 1.0) * resolution - o) / d;
                t_delta[i] = resolution / d;
            } else if d < 0.0 {
                step[i] = -1;
                t_max[i] = (k as f64 * resolution - o) / d;
                t_delta[i] = -resolution / d;
            }
        }

        Some(Self {
            current: start,
            end: end_key,
            step,
            t_max,
            t_delta,
            remaining: start.manhattan(end_key),
            done: start == end_key,
        })
    }

    /// The endpoint cell (never yielded).
    pub fn end_key(&self) -> VoxelKey {
        self.end
    }

    fn advance(&mut self) {
        if self.remaining == 0 {
            self.done = true;
            return;
        }
        self.remaining -= 1;

        let axis = if self.t_max[0] <= self.t_max[1] && self.t_max[0] <= self.t_max[2] {
            0
        } else if self.t_max[1] <= self.t_max[2] {
            1
        } else {
            2
        };
        if !self.t_max[axis].is_finite() || self.t_max[axis] > 1.0 + 1e-9 {
            self.done = true;
            return;
        }

        match axis {
            0 => self.current.x += self.step[0],
            1 => self.current.y += self.step[1],
            _ => self.current.z += self.step[2],
        }
        self.t_max[axis] += self.t_delta[axis];
        if self.current == self.end {
            self.done = true;
        }
    }
}

impl Iterator for RayKeys {
    type Item = VoxelKey;

    fn next(&mut self) -> Option<VoxelKey> {
        if self.done {
            return None;
        }
        let out = self.current;
        self.advance();
        Some(out)
    }
}
