//! Dense occupancy volume.
//!
//! Stores one log-odds occupancy value per observed cell.  Inserting a scan
//! casts a ray from the sensor origin to every endpoint: traversed cells
//! receive a *miss*, endpoint cells receive a *hit*.  Within one scan each
//! cell is updated at most once and a hit overrides a miss, so a dense cloud
//! hitting the same surface cell does not erase it with its own rays.
//!
//! Log-odds `l` relates to probability `p` by `l = ln(p / (1 − p))`; updates
//! are additions clamped to `[clamp_min, clamp_max]` so that the map stays
//! responsive to change.
//!
//! # Example
//!
//! ```rust
//! use fusemap_maps::occupancy::{OccupancyParams, OccupancyVolume};
//! use fusemap_types::Point3;
//!
//! let mut map = OccupancyVolume::new(OccupancyParams { resolution: 0.5, ..Default::default() }).unwrap();
//! map.insert(&[Point3::new(2.2, 0.2, 0.2)], Point3::new(0.2, 0.2, 0.2));
//! map.refresh();
//!
//! assert!(map.is_occupied_at(Point3::new(2.2, 0.2, 0.2)));
//! assert!(!map.is_occupied_at(Point3::new(1.2, 0.2, 0.2)));
//! ```

use std::collections::{HashMap, HashSet};

use fusemap_types::Point3;
use serde::{Deserialize, Serialize};

use crate::error::MapsError;
use crate::raycast::RayKeys;
use crate::snapshot::{CellSnapshot, InsertStats};
use crate::voxel::{Aabb, VoxelKey, bounds_of};

// ────────────────────────────────────────────────────────────────────────────
// Parameters
// ────────────────────────────────────────────────────────────────────────────

/// Sensor model and cell size shared by the log-odds backends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OccupancyParams {
    /// Cell edge length in metres.
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    /// Probability that an endpoint cell is occupied.
    #[serde(default = "default_prob_hit")]
    pub prob_hit: f64,
    /// Probability that a traversed cell is occupied.
    #[serde(default = "default_prob_miss")]
    pub prob_miss: f64,
    #[serde(default = "default_clamp_min")]
    pub clamp_min: f64,
    #[serde(default = "default_clamp_max")]
    pub clamp_max: f64,
    /// Probability above which a cell counts as occupied.
    #[serde(default = "default_occupied_threshold")]
    pub occupied_threshold: f64,
    /// Rays are truncated at this length (metres); `<= 0` means unlimited.
    #[serde(default = "default_max_range")]
    pub max_range: f64,
}

pub(crate) fn default_resolution() -> f64 {
    1.0
}
fn default_prob_hit() -> f64 {
    0.7
}
fn default_prob_miss() -> f64 {
    0.4
}
fn default_clamp_min() -> f64 {
    0.1192
}
fn default_clamp_max() -> f64 {
    0.971
}
fn default_occupied_threshold() -> f64 {
    0.5
}
fn default_max_range() -> f64 {
    -1.0
}

impl Default for OccupancyParams {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            prob_hit: default_prob_hit(),
            prob_miss: default_prob_miss(),
            clamp_min: default_clamp_min(),
            clamp_max: default_clamp_max(),
            occupied_threshold: default_occupied_threshold(),
            max_range: default_max_range(),
        }
    }
}

/// Validate a cell edge length.
pub(crate) fn check_resolution(resolution: f64) -> Result<(), MapsError> {
    if resolution.is_finite() && resolution > 0.0 {
        Ok(())
    } else {
        Err(MapsError::InvalidParams(format!(
            "resolution must be a positive finite number, got {resolution}"
        )))
    }
}

impl OccupancyParams {
    pub fn validate(&self) -> Result<(), MapsError> {
        check_resolution(self.resolution)?;
        let probs = [
            ("prob_hit", self.prob_hit),
            ("prob_miss", self.prob_miss),
            ("clamp_min", self.clamp_min),
            ("clamp_max", self.clamp_max),
            ("occupied_threshold", self.occupied_threshold),
        ];
        for (name, p) in probs {
            if !(p > 0.0 && p < 1.0) {
                return Err(MapsError::InvalidParams(format!(
                    "{name} must lie strictly between 0 and 1, got {p}"
                )));
            }
        }
        if self.prob_hit <= 0.5 || self.prob_miss >= 0.5 {
            return Err(MapsError::InvalidParams(format!(
                "expected prob_hit > 0.5 > prob_miss, got {} / {}",
                self.prob_hit, self.prob_miss
            )));
        }
        if self.clamp_min >= self.clamp_max {
            return Err(MapsError::InvalidParams(format!(
                "clamp_min ({}) must be below clamp_max ({})",
                self.clamp_min, self.clamp_max
            )));
        }
        if self.max_range.is_nan() {
            return Err(MapsError::InvalidParams("max_range must not be NaN".to_string()));
        }
        Ok(())
    }

    pub(crate) fn model(&self) -> LogOddsModel {
        LogOddsModel {
            hit: log_odds(self.prob_hit),
            miss: log_odds(self.prob_miss),
            min: log_odds(self.clamp_min),
            max: log_odds(self.clamp_max),
            threshold: log_odds(self.occupied_threshold),
        }
    }

    pub(crate) fn max_range(&self) -> Option<f64> {
        (self.max_range > 0.0).then_some(self.max_range)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Log-odds helpers
// ────────────────────────────────────────────────────────────────────────────

pub fn log_odds(p: f64) -> f32 {
    (p / (1.0 - p)).ln() as f32
}

pub fn probability(l: f32) -> f64 {
    1.0 / (1.0 + (-(l as f64)).exp())
}

/// Pre-computed log-odds form of [`OccupancyParams`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LogOddsModel {
    pub hit: f32,
    pub miss: f32,
    pub min: f32,
    pub max: f32,
    pub threshold: f32,
}

impl LogOddsModel {
    pub fn apply(&self, l: f32, delta: f32) -> f32 {
        (l + delta).clamp(self.min, self.max)
    }
}

/// Cells touched by one scan, deduplicated.  Hits win over misses.
#[derive(Debug, Default)]
pub(crate) struct ScanUpdate {
    pub free: HashSet<VoxelKey>,
    pub occupied: HashSet<VoxelKey>,
    /// Endpoint of each accepted point, paired with its cell, in input order.
    pub endpoints: Vec<(VoxelKey, Point3)>,
    pub discarded: u64,
}

impl ScanUpdate {
    /// Ray-cast every point from `origin`.
    pub fn compute(points: &[Point3], origin: Point3, resolution: f64, max_range: Option<f64>) -> Self {
        let mut update = ScanUpdate::default();
        let origin_ok = VoxelKey::from_point(origin, resolution).is_some();

        for &p in points {
            let delta = p.sub(origin);
            let dist = delta.norm();
            let truncated = max_range.filter(|&r| dist > r);
            let ray_end = match truncated {
                Some(r) => origin.add(delta.scale(r / dist)),
                None => p,
            };

            // The ray end must be addressable; a truncated end stands in for
            // an endpoint beyond the key range.
            let Some(end_key) = VoxelKey::from_point(ray_end, resolution) else {
                update.discarded += 1;
                continue;
            };

            if origin_ok && let Some(ray) = RayKeys::new(origin, ray_end, resolution) {
                update.free.extend(ray);
            }
            if truncated.is_none() {
                update.occupied.insert(end_key);
                update.endpoints.push((end_key, p));
            }
        }

        update.free.retain(|k| !update.occupied.contains(k));
        update
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OccupancyVolume
// ────────────────────────────────────────────────────────────────────────────

/// Sparse log-odds voxel map.
#[derive(Debug, Clone)]
pub struct OccupancyVolume {
    params: OccupancyParams,
    model: LogOddsModel,
    cells: HashMap<VoxelKey, f32>,
    stats: InsertStats,
    // Derived fields, recomputed by `refresh`.
    dirty: bool,
    occupied: usize,
    bounds: Option<Aabb>,
}

impl OccupancyVolume {
    /// Create an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`MapsError::InvalidParams`] when the parameters fail
    /// [`OccupancyParams::validate`].
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

    /// Number of cells that have been observed at least once.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn insert_stats(&self) -> &InsertStats {
        &self.stats
    }

    /// Fuse one scan taken from `origin` (map frame).
    pub fn insert(&mut self, points: &[Point3], origin: Point3) {
        self.stats.record(points.len(), origin);
        if points.is_empty() {
            return;
        }

        let update = ScanUpdate::compute(points, origin, self.params.resolution, self.params.max_range());
        self.stats.discarded += update.discarded;

        for key in &update.free {
            let l = self.cells.entry(*key).or_insert(0.0);
            *l = self.model.apply(*l, self.model.miss);
        }
        for key in &update.occupied {
            let l = self.cells.entry(*key).or_insert(0.0);
            *l = self.model.apply(*l, self.model.hit);
        }
        self.dirty = true;
    }

    /// Recompute derived aggregates (occupied count, occupied bounds).
    pub fn refresh(&mut self) {
        if !self.dirty {
            return;
        }
        let threshold = self.model.threshold;
        let occupied: Vec<VoxelKey> = self
            .cells
            .iter()
            .filter(|&(_, &l)| l > threshold)
            .map(|(k, _)| *k)
            .collect();
        self.occupied = occupied.len();
        self.bounds = bounds_of(occupied, self.params.resolution);
        self.dirty = false;
    }

    /// Occupied-cell count as of the last [`refresh`][Self::refresh].
    pub fn occupied_count(&self) -> usize {
        self.occupied
    }

    /// Bounds of the occupied cells as of the last refresh.
    pub fn bounds(&self) -> Option<Aabb> {
        self.bounds
    }

    pub fn log_odds(&self, key: VoxelKey) -> Option<f32> {
        self.cells.get(&key).copied()
    }

    /// Occupancy probability of a cell; `None` for unobserved cells.
    pub fn probability(&self, key: VoxelKey) -> Option<f64> {
        self.log_odds(key).map(probability)
    }

    pub fn is_occupied(&self, key: VoxelKey) -> bool {
        self.log_odds(key).is_some_and(|l| l > self.model.threshold)
    }

    pub fn is_occupied_at(&self, p: Point3) -> bool {
        VoxelKey::from_point(p, self.params.resolution).is_some_and(|k| self.is_occupied(k))
    }

    /// Observed cells with their log-odds, sorted by key.
    pub fn cells(&self) -> Vec<(VoxelKey, f32)> {
        let mut cells: Vec<_> = self.cells.iter().map(|(k, l)| (*k, *l)).collect();
        cells.sort_unstable_by_key(|(k, _)| *k);
        cells
    }

    pub(crate) fn snapshot_cells(&self) -> Vec<CellSnapshot> {
        self.cells()
            .into_iter()
            .map(|(key, l)| CellSnapshot {
                key,
                occupancy: Some(probability(l)),
                distribution: None,
            })
            .collect()
    }

    /// Restore a cell from a persisted payload.
    pub(crate) fn restore_cell(&mut self, key: VoxelKey, l: f32) {
        self.cells.insert(key, l.clamp(self.model.min, self.model.max));
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(resolution: f64) -> OccupancyVolume {
        OccupancyVolume::new(OccupancyParams {
            resolution,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn rejects_invalid_params() {
        for params in [
            OccupancyParams { resolution: 0.0, ..Default::default() },
            OccupancyParams { resolution: -1.0, ..Default::default() },
            OccupancyParams { resolution: f64::NAN, ..Default::default() },
            OccupancyParams { prob_hit: 1.0, ..Default::default() },
            OccupancyParams { prob_miss: 0.6, ..Default::default() },
            OccupancyParams { clamp_min: 0.9, clamp_max: 0.2, ..Default::default() },
        ] {
            assert!(OccupancyVolume::new(params).is_err(), "{params:?} accepted");
        }
    }

    #[test]
    fn empty_insert_changes_no_cells() {
        let mut map = volume(0.5);
        map.insert(&[], Point3::origin());
        assert!(map.is_empty());
        assert_eq!(map.insert_stats().insertions, 1);
        assert_eq!(map.insert_stats().points, 0);
    }

    #[test]
    fn ray_marks_free_and_endpoint_occupied() {
        let mut map = volume(1.0);
        map.insert(&[Point3::new(3.5, 0.5, 0.5)], Point3::new(0.5, 0.5, 0.5));
        map.refresh();

        for x in 0..3 {
            let p = map.probability(VoxelKey::new(x, 0, 0)).unwrap();
            assert!(p < 0.5, "cell {x} should be free, p={p}");
        }
        assert!(map.is_occupied(VoxelKey::new(3, 0, 0)));
        assert_eq!(map.len(), 4);
        assert_eq!(map.occupied_count(), 1);
    }

    #[test]
    fn hit_wins_over_miss_within_one_scan() {
        let mut map = volume(1.0);
        // The second ray passes through the first endpoint's cell.
        map.insert(
            &[Point3::new(2.5, 0.5, 0.5), Point3::new(5.5, 0.5, 0.5)],
            Point3::new(0.5, 0.5, 0.5),
        );
        assert!(map.is_occupied(VoxelKey::new(2, 0, 0)));
        assert!(map.is_occupied(VoxelKey::new(5, 0, 0)));
    }

    #[test]
    fn duplicate_endpoints_update_cell_once_per_scan() {
        let mut map = volume(1.0);
        let p = Point3::new(1.5, 0.5, 0.5);
        map.insert(&[p, p, p], Point3::new(0.5, 0.5, 0.5));
        let once = map.log_odds(VoxelKey::new(1, 0, 0)).unwrap();
        assert!((once - log_odds(0.7)).abs() < 1e-6);
    }

    #[test]
    fn repeated_scans_accumulate_until_clamped() {
        let mut map = volume(1.0);
        let p = Point3::new(1.5, 0.5, 0.5);
        for _ in 0..100 {
            map.insert(&[p], Point3::new(0.5, 0.5, 0.5));
        }
        let l = map.log_odds(VoxelKey::new(1, 0, 0)).unwrap();
        assert!((l - log_odds(0.971)).abs() < 1e-5);
        let free = map.log_odds(VoxelKey::new(0, 0, 0)).unwrap();
        assert!((free - log_odds(0.1192)).abs() < 1e-5);
        assert_eq!(map.insert_stats().insertions, 100);
    }

    #[test]
    fn max_range_truncates_ray_without_hit() {
        let mut map = OccupancyVolume::new(OccupancyParams {
            resolution: 1.0,
            max_range: 2.0,
            ..Default::default()
        })
        .unwrap();
        map.insert(&[Point3::new(10.5, 0.5, 0.5)], Point3::new(0.5, 0.5, 0.5));
        assert!(map.probability(VoxelKey::new(10, 0, 0)).is_none());
        assert!(map.probability(VoxelKey::new(1, 0, 0)).unwrap() < 0.5);
        assert!(map.probability(VoxelKey::new(5, 0, 0)).is_none());
    }

    #[test]
    fn refresh_computes_bounds_of_occupied_cells() {
        let mut map = volume(1.0);
        map.insert(
            &[Point3::new(2.5, 0.5, 0.5), Point3::new(0.5, 3.5, 0.5)],
            Point3::new(0.5, 0.5, 0.5),
        );
        assert!(map.bounds().is_none());
        map.refresh();
        let b = map.bounds().unwrap();
        assert_eq!(b.min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(b.max, Point3::new(3.0, 4.0, 1.0));
    }

    #[test]
    fn unaddressable_points_are_counted_not_stored() {
        let mut map = volume(1.0);
        map.insert(&[Point3::new(1e300, 0.0, 0.0)], Point3::origin());
        assert!(map.is_empty());
        assert_eq!(map.insert_stats().discarded, 1);
    }

    #[test]
    fn far_outlier_beyond_key_range_touches_no_cells() {
        let mut map = volume(0.05);
        map.insert(
            &[Point3::new(1.0e6, 0.0, 0.0), Point3::new(0.52, 0.02, 0.02)],
            Point3::new(0.02, 0.02, 0.02),
        );
        assert_eq!(map.insert_stats().discarded, 1);
        assert_eq!(map.insert_stats().points, 2);
        // Only the ray of the near point: ten free cells and its endpoint.
        assert_eq!(map.len(), 11);
    }

    #[test]
    fn ray_cost_is_bounded_at_the_edge_of_the_key_range() {
        let mut map = volume(1.0);
        let origin = Point3::new(0.5, 0.5, 0.5);
        let edge = crate::voxel::KEY_LIMIT as f64;
        map.insert(&[Point3::new(edge - 0.5, 0.5, 0.5)], origin);
        assert_eq!(map.len(), crate::voxel::KEY_LIMIT as usize);
        assert!(map.is_occupied(VoxelKey::new(crate::voxel::KEY_LIMIT - 1, 0, 0)));

        map.insert(&[Point3::new(edge + 0.5, 0.5, 0.5)], origin);
        assert_eq!(map.len(), crate::voxel::KEY_LIMIT as usize);
        assert_eq!(map.insert_stats().discarded, 1);
    }

    #[test]
    fn max_range_still_clears_toward_unaddressable_points() {
        let mut map = OccupancyVolume::new(OccupancyParams {
            resolution: 1.0,
            max_range: 2.0,
            ..Default::default()
        })
        .unwrap();
        map.insert(&[Point3::new(1.0e9, 0.5, 0.5)], Point3::new(0.5, 0.5, 0.5));
        assert_eq!(map.insert_stats().discarded, 0);
        assert_eq!(map.len(), 2);
        assert!(map.probability(VoxelKey::new(1, 0, 0)).unwrap() < 0.5);
        assert!(!map.is_occupied(VoxelKey::new(2, 0, 0)));
    }
}
