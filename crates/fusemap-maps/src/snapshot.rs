//! Read-only map views.
//!
//! A [`MapSnapshot`] is an owned copy of a backend's cells taken after a
//! consistency pass.  Readers query it freely while fusion continues on the
//! live backend.

use std::collections::HashMap;

use fusemap_types::Point3;
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::voxel::{Aabb, VoxelKey};

/// Bookkeeping over the `insert` calls a backend has received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsertStats {
    /// Number of `insert` calls, including calls with no points.
    pub insertions: u64,
    /// Points received across all calls.
    pub points: u64,
    /// Points that had no addressable cell.
    pub discarded: u64,
    /// Sensor origin of the most recent call.
    pub last_origin: Option<Point3>,
}

impl InsertStats {
    pub(crate) fn record(&mut self, points: usize, origin: Point3) {
        self.insertions += 1;
        self.points += points as u64;
        self.last_origin = Some(origin);
    }
}

/// Frozen NDT statistics of one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellDistribution {
    pub count: u64,
    pub mean: Point3,
    /// Sample covariance; `None` with fewer than two samples.
    pub covariance: Option<[[f64; 3]; 3]>,
    pub degenerate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub key: VoxelKey,
    /// Occupancy probability, for backends that track one.
    pub occupancy: Option<f64>,
    /// Point distribution, for NDT backends.
    pub distribution: Option<CellDistribution>,
}

/// Immutable, internally consistent copy of a backend.
#[derive(Debug, Clone)]
pub struct MapSnapshot {
    kind: BackendKind,
    resolution: f64,
    occupied_threshold: Option<f64>,
    cells: Vec<CellSnapshot>,
    index: HashMap<VoxelKey, usize>,
    bounds: Option<Aabb>,
    stats: InsertStats,
}

impl MapSnapshot {
    pub(crate) fn new(
        kind: BackendKind,
        resolution: f64,
        occupied_threshold: Option<f64>,
        cells: Vec<CellSnapshot>,
        bounds: Option<Aabb>,
        stats: InsertStats,
    ) -> Self {
        let index = cells.iter().enumerate().map(|(i, c)| (c.key, i)).collect();
        Self {
            kind,
            resolution,
            occupied_threshold,
            cells,
            index,
            bounds,
            stats,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// All cells, sorted by key.
    pub fn cells(&self) -> &[CellSnapshot] {
        &self.cells
    }

    pub fn cell(&self, key: VoxelKey) -> Option<&CellSnapshot> {
        self.index.get(&key).map(|&i| &self.cells[i])
    }

    pub fn cell_at(&self, p: Point3) -> Option<&CellSnapshot> {
        VoxelKey::from_point(p, self.resolution).and_then(|k| self.cell(k))
    }

    /// Occupancy probability at `p`; `None` when unobserved or when the
    /// backend does not track occupancy.
    pub fn occupancy_at(&self, p: Point3) -> Option<f64> {
        self.cell_at(p).and_then(|c| c.occupancy)
    }

    pub fn distribution_at(&self, p: Point3) -> Option<&CellDistribution> {
        self.cell_at(p).and_then(|c| c.distribution.as_ref())
    }

    /// Cells considered occupied.
    ///
    /// Occupancy backends use their threshold; pure NDT grids report every
    /// cell with a usable distribution.
    pub fn occupied_cells(&self) -> Vec<VoxelKey> {
        self.cells
            .iter()
            .filter(|c| match (self.occupied_threshold, c.occupancy) {
                (Some(t), Some(p)) => p > t,
                (Some(_), None) => false,
                (None, _) => c.distribution.as_ref().is_some_and(|d| !d.degenerate),
            })
            .map(|c| c.key)
            .collect()
    }

    /// Bounds reported by the backend at snapshot time: occupied cells for
    /// occupancy backends, every cell for NDT grids.
    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    pub fn insert_stats(&self) -> &InsertStats {
        &self.stats
    }
}
