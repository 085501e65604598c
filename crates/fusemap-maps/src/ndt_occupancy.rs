//! Occupancy-weighted NDT grid.
//!
//! Combines the two other backends: every cell holds a point
//! [`Distribution`] together with a log-odds occupancy value.  Scan endpoints
//! feed the distribution of their cell and count as a hit; cells crossed by
//! a ray count as a miss.  A cell seen through often enough loses its weight
//! even though its distribution is kept.

use std::collections::HashMap;

use fusemap_types::Point3;

use crate::error::MapsError;
use crate::ndt::Distribution;
use crate::occupancy::{LogOddsModel, OccupancyParams, ScanUpdate, probability};
use crate::snapshot::{CellSnapshot, InsertStats};
use crate::voxel::{Aabb, VoxelKey, bounds_of};

/// State of one cell.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightedCell {
    pub distribution: Distribution,
    pub log_odds: f32,
    pub hits: u32,
    pub misses: u32,
}

impl WeightedCell {
    pub fn occupancy(&self) -> f64 {
        probability(self.log_odds)
    }
}

#[derive(Debug, Clone)]
pub struct OccupancyNdtGrid {
    params: OccupancyParams,
    model: LogOddsModel,
    cells: HashMap<VoxelKey, WeightedCell>,
    stats: InsertStats,
    dirty: bool,
    occupied: usize,
    bounds: Option<Aabb>,
}

impl OccupancyNdtGrid {
    pub fn new(params: OccupancyParams) -> Result<Self, MapsError> {
        params.validate()?;
        Ok(Self {
            params,
            model: params.model(),
            cells: HashMap::new(),
            stats: InsertStats::default(),
            dirty: false,
            occupied: 0,
            bounds: None,
        })
    }

    pub fn params(&self) -> &OccupancyParams {
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

    pub fn insert(&mut self, points: &[Point3], origin: Point3) {
        self.stats.record(points.len(), origin);
        if points.is_empty() {
            return;
        }

        let update = ScanUpdate::compute(points, origin, self.params.resolution, self.params.max_range());
        self.stats.discarded += update.discarded;

        for key in &update.free {
            let cell = self.cells.entry(*key).or_default();
            cell.log_odds = self.model.apply(cell.log_odds, self.model.miss);
            cell.misses = cell.misses.saturating_add(1);
        }
        for key in &update.occupied {
            let cell = self.cells.entry(*key).or_default();
            cell.log_odds = self.model.apply(cell.log_odds, self.model.hit);
            cell.hits = cell.hits.saturating_add(1);
        }
        for (key, p) in &update.endpoints {
            self.cells.entry(*key).or_default().distribution.add(*p);
        }
        self.dirty = true;
    }

    pub fn refresh(&mut self) {
        if !self.dirty {
            return;
        }
        let threshold = self.model.threshold;
        let occupied: Vec<VoxelKey> = self
            .cells
            .iter()
            .filter(|(_, c)| c.log_odds > threshold)
            .map(|(k, _)| *k)
            .collect();
        self.occupied = occupied.len();
        self.bounds = bounds_of(occupied, self.params.resolution);
        self.dirty = false;
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied
    }

    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    pub fn cell(&self, key: VoxelKey) -> Option<&WeightedCell> {
        self.cells.get(&key)
    }

    pub fn cell_at(&self, p: Point3) -> Option<&WeightedCell> {
        VoxelKey::from_point(p, self.params.resolution).and_then(|k| self.cells.get(&k))
    }

    pub fn is_occupied(&self, key: VoxelKey) -> bool {
        self.cells.get(&key).is_some_and(|c| c.log_odds > self.model.threshold)
    }

    /// All cells, sorted by key.
    pub fn cells(&self) -> Vec<(VoxelKey, WeightedCell)> {
        let mut cells: Vec<_> = self.cells.iter().map(|(k, c)| (*k, *c)).collect();
        cells.sort_unstable_by_key(|(k, _)| *k);
        cells
    }

    pub(crate) fn snapshot_cells(&self) -> Vec<CellSnapshot> {
        self.cells()
            .into_iter()
            .map(|(key, c)| CellSnapshot {
                key,
                occupancy: Some(c.occupancy()),
                distribution: (c.distribution.count() > 0).then(|| c.distribution.to_snapshot()),
            })
            .collect()
    }

    pub(crate) fn restore_cell(&mut self, key: VoxelKey, mut cell: WeightedCell) {
        cell.log_odds = cell.log_odds.clamp(self.model.min, self.model.max);
        self.cells.insert(key, cell);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> OccupancyNdtGrid {
        OccupancyNdtGrid::new(OccupancyParams::default()).unwrap()
    }

    #[test]
    fn endpoints_feed_distribution_and_hit() {
        let mut g = grid();
        let origin = Point3::new(0.5, 0.5, 0.5);
        g.insert(
            &[Point3::new(3.2, 0.4, 0.5), Point3::new(3.8, 0.6, 0.5)],
            origin,
        );
        g.refresh();

        let end = g.cell(VoxelKey::new(3, 0, 0)).unwrap();
        assert_eq!(end.distribution.count(), 2);
        assert_eq!(end.hits, 1);
        assert!((end.distribution.mean().x - 3.5).abs() < 1e-12);
        assert!(g.is_occupied(VoxelKey::new(3, 0, 0)));
        assert_eq!(g.occupied_count(), 1);
    }

    #[test]
    fn traversed_cells_get_misses_but_no_samples() {
        let mut g = grid();
        g.insert(&[Point3::new(3.5, 0.5, 0.5)], Point3::new(0.5, 0.5, 0.5));
        for x in 0..3 {
            let c = g.cell(VoxelKey::new(x, 0, 0)).unwrap();
            assert_eq!(c.misses, 1);
            assert_eq!(c.distribution.count(), 0);
            assert!(c.occupancy() < 0.5);
        }
    }

    #[test]
    fn see_through_cell_loses_weight_but_keeps_samples() {
        let mut g = grid();
        let origin = Point3::new(0.5, 0.5, 0.5);
        g.insert(&[Point3::new(2.5, 0.5, 0.5)], origin);
        for _ in 0..5 {
            g.insert(&[Point3::new(6.5, 0.5, 0.5)], origin);
        }
        let c = g.cell(VoxelKey::new(2, 0, 0)).unwrap();
        assert_eq!(c.distribution.count(), 1);
        assert_eq!(c.misses, 5);
        assert!(!g.is_occupied(VoxelKey::new(2, 0, 0)));
    }

    #[test]
    fn snapshot_cells_omit_empty_distributions() {
        let mut g = grid();
        g.insert(&[Point3::new(2.5, 0.5, 0.5)], Point3::new(0.5, 0.5, 0.5));
        let cells = g.snapshot_cells();
        assert_eq!(cells.len(), 3);
        assert!(cells[0].distribution.is_none());
        assert_eq!(cells[2].key, VoxelKey::new(2, 0, 0));
        assert_eq!(cells[2].distribution.as_ref().unwrap().count, 1);
    }
}
