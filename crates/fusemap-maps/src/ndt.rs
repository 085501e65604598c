//! Normal-Distributions-Transform grid.
//!
//! Each cell keeps a running estimate of the mean and covariance of the
//! points that fell into it.  Updates use Welford's algorithm, which stays
//! accurate when the cell sits far from the map origin (the naive
//! `Σx² − n·μ²` form loses most of its significant digits there).
//!
//! The covariance itself is derived lazily: [`NdtGrid::refresh`] recomputes
//! the per-cell covariance and flags cells whose distribution is degenerate
//! (fewer than [`MIN_POINTS`] samples, or a singular covariance such as a
//! perfectly planar patch).

use std::collections::HashMap;

use fusemap_types::Point3;
use serde::{Deserialize, Serialize};

use crate::error::MapsError;
use crate::occupancy::{check_resolution, default_resolution};
use crate::snapshot::{CellDistribution, CellSnapshot, InsertStats};
use crate::voxel::{Aabb, VoxelKey, bounds_of};

/// Minimum number of samples for a cell distribution to be usable.
pub const MIN_POINTS: u64 = 3;

/// Determinants at or below this value are treated as singular.
const SINGULAR_DET: f64 = 1e-12;

// ────────────────────────────────────────────────────────────────────────────
// Distribution
// ────────────────────────────────────────────────────────────────────────────

/// Running mean / scatter accumulator over 3-D points.
///
/// The scatter matrix is symmetric and stored as its upper triangle
/// `[xx, xy, xz, yy, yz, zz]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Distribution {
    n: u64,
    mean: Point3,
    scatter: [f64; 6],
}

impl Distribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an accumulator from persisted state.
    pub fn from_parts(n: u64, mean: Point3, scatter: [f64; 6]) -> Self {
        Self { n, mean, scatter }
    }

    pub fn add(&mut self, p: Point3) {
        self.n += 1;
        let delta = p.sub(self.mean);
        self.mean = self.mean.add(delta.scale(1.0 / self.n as f64));
        let delta2 = p.sub(self.mean);
        let s = &mut self.scatter;
        s[0] += delta.x * delta2.x;
        s[1] += delta.x * delta2.y;
        s[2] += delta.x * delta2.z;
        s[3] += delta.y * delta2.y;
        s[4] += delta.y * delta2.z;
        s[5] += delta.z * delta2.z;
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> Point3 {
        self.mean
    }

    pub fn scatter(&self) -> [f64; 6] {
        self.scatter
    }

    /// Unbiased sample covariance; `None` with fewer than two samples.
    pub fn covariance(&self) -> Option<[[f64; 3]; 3]> {
        if self.n < 2 {
            return None;
        }
        let k = 1.0 / (self.n - 1) as f64;
        let s = self.scatter;
        Some([
            [s[0] * k, s[1] * k, s[2] * k],
            [s[1] * k, s[3] * k, s[4] * k],
            [s[2] * k, s[4] * k, s[5] * k],
        ])
    }

    /// True when the distribution cannot be used for matching.
    pub fn is_degenerate(&self) -> bool {
        if self.n < MIN_POINTS {
            return true;
        }
        self.covariance().is_none_or(|c| determinant(&c) <= SINGULAR_DET)
    }

    pub(crate) fn to_snapshot(self) -> CellDistribution {
        CellDistribution {
            count: self.n,
            mean: self.mean,
            covariance: self.covariance(),
            degenerate: self.is_degenerate(),
        }
    }
}

pub fn determinant(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

// ────────────────────────────────────────────────────────────────────────────
// NdtGrid
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NdtParams {
    #[serde(default = "default_resolution")]
    pub resolution: f64,
}

impl Default for NdtParams {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
        }
    }
}

impl NdtParams {
    pub fn validate(&self) -> Result<(), MapsError> {
        check_resolution(self.resolution)
    }
}

/// Grid of per-cell point distributions.
#[derive(Debug, Clone)]
pub struct NdtGrid {
    params: NdtParams,
    cells: HashMap<VoxelKey, Distribution>,
    stats: InsertStats,
    dirty: bool,
    usable: usize,
    bounds: Option<Aabb>,
}

impl NdtGrid {
    pub fn new(params: NdtParams) -> Result<Self, MapsError> {
        params.validate()?;
        Ok(Self {
            params,
            cells: HashMap::new(),
            stats: InsertStats::default(),
            dirty: false,
            usable: 0,
            bounds: None,
        })
    }

    pub fn params(&self) -> &NdtParams {
        &self.params
    }

    pub fn resolution(&self) -> f64 {
        self.params.resolution
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn insert_stats(&self) -> &InsertStats {
        &self.stats
    }

    /// Add every point to the distribution of its cell.  The origin is only
    /// recorded; distribution grids do not clear free space.
    pub fn insert(&mut self, points: &[Point3], origin: Point3) {
        self.stats.record(points.len(), origin);
        for &p in points {
            match VoxelKey::from_point(p, self.params.resolution) {
                Some(key) => self.cells.entry(key).or_default().add(p),
                None => self.stats.discarded += 1,
            }
        }
        if !points.is_empty() {
            self.dirty = true;
        }
    }

    /// Recompute the usable-cell count and bounds.
    pub fn refresh(&mut self) {
        if !self.dirty {
            return;
        }
        self.usable = self.cells.values().filter(|d| !d.is_degenerate()).count();
        self.bounds = bounds_of(self.cells.keys().copied(), self.params.resolution);
        self.dirty = false;
    }

    /// Cells with a non-degenerate distribution, as of the last refresh.
    pub fn usable_count(&self) -> usize {
        self.usable
    }

    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    pub fn distribution(&self, key: VoxelKey) -> Option<&Distribution> {
        self.cells.get(&key)
    }

    pub fn distribution_at(&self, p: Point3) -> Option<&Distribution> {
        VoxelKey::from_point(p, self.params.resolution).and_then(|k| self.cells.get(&k))
    }

    /// All cells, sorted by key.
    pub fn cells(&self) -> Vec<(VoxelKey, Distribution)> {
        let mut cells: Vec<_> = self.cells.iter().map(|(k, d)| (*k, *d)).collect();
        cells.sort_unstable_by_key(|(k, _)| *k);
        cells
    }

    pub(crate) fn snapshot_cells(&self) -> Vec<CellSnapshot> {
        self.cells()
            .into_iter()
            .map(|(key, d)| CellSnapshot {
                key,
                occupancy: None,
                distribution: Some(d.to_snapshot()),
            })
            .collect()
    }

    pub(crate) fn restore_cell(&mut self, key: VoxelKey, d: Distribution) {
        self.cells.insert(key, d);
        self.dirty = true;
    }
}
