//! The closed set of map backends.
//!
//! [`MapBackend`] is an enum rather than a trait object: the set of
//! representations is fixed at compile time and every operation dispatches
//! statically.  [`BackendConfig`] carries the parameters needed to build one
//! and is what the `map.toml` descriptor records.

use std::fmt;
use std::io::{Read, Write};

use fusemap_types::Point3;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::MapsError;
use crate::ndt::{NdtGrid, NdtParams};
use crate::ndt_occupancy::OccupancyNdtGrid;
use crate::occupancy::{OccupancyParams, OccupancyVolume};
use crate::snapshot::{InsertStats, MapSnapshot};

// ────────────────────────────────────────────────────────────────────────────
// BackendKind
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Dense log-odds occupancy volume.
    #[default]
    Occupancy,
    /// Normal-distributions grid.
    Ndt,
    /// Normal-distributions grid with per-cell occupancy.
    OccupancyNdt,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Occupancy => "occupancy",
            BackendKind::Ndt => "ndt",
            BackendKind::OccupancyNdt => "occupancy_ndt",
        }
    }

    /// Name of the payload file saved next to `map.toml`.
    pub fn payload_file_name(self) -> &'static str {
        match self {
            BackendKind::Occupancy => "occupancy.bin",
            BackendKind::Ndt | BackendKind::OccupancyNdt => "ndt.bin",
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            BackendKind::Occupancy => 1,
            BackendKind::Ndt => 2,
            BackendKind::OccupancyNdt => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(BackendKind::Occupancy),
            2 => Some(BackendKind::Ndt),
            3 => Some(BackendKind::OccupancyNdt),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// BackendConfig
// ────────────────────────────────────────────────────────────────────────────

/// Backend kind together with its parameters.
///
/// Serialised as a table tagged by `kind`:
///
/// ```toml
/// kind = "occupancy"
/// resolution = 0.5
/// prob_hit = 0.7
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Occupancy(OccupancyParams),
    Ndt(NdtParams),
    OccupancyNdt(OccupancyParams),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Occupancy(OccupancyParams::default())
    }
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Occupancy(_) => BackendKind::Occupancy,
            BackendConfig::Ndt(_) => BackendKind::Ndt,
            BackendConfig::OccupancyNdt(_) => BackendKind::OccupancyNdt,
        }
    }

    pub fn resolution(&self) -> f64 {
        match self {
            BackendConfig::Occupancy(p) | BackendConfig::OccupancyNdt(p) => p.resolution,
            BackendConfig::Ndt(p) => p.resolution,
        }
    }

    pub fn validate(&self) -> Result<(), MapsError> {
        match self {
            BackendConfig::Occupancy(p) | BackendConfig::OccupancyNdt(p) => p.validate(),
            BackendConfig::Ndt(p) => p.validate(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MapBackend
// ────────────────────────────────────────────────────────────────────────────

/// A live map.  Not internally synchronised; the owner serialises access.
#[derive(Debug, Clone)]
pub enum MapBackend {
    Occupancy(OccupancyVolume),
    Ndt(NdtGrid),
    OccupancyNdt(OccupancyNdtGrid),
}

impl MapBackend {
    /// Construct an empty backend.
    ///
    /// # Errors
    ///
    /// [`MapsError::InvalidParams`] when the parameters do not validate.
    pub fn build(config: &BackendConfig) -> Result<Self, MapsError> {
        Ok(match *config {
            BackendConfig::Occupancy(p) => MapBackend::Occupancy(OccupancyVolume::new(p)?),
            BackendConfig::Ndt(p) => MapBackend::Ndt(NdtGrid::new(p)?),
            BackendConfig::OccupancyNdt(p) => MapBackend::OccupancyNdt(OccupancyNdtGrid::new(p)?),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            MapBackend::Occupancy(_) => BackendKind::Occupancy,
            MapBackend::Ndt(_) => BackendKind::Ndt,
            MapBackend::OccupancyNdt(_) => BackendKind::OccupancyNdt,
        }
    }

    /// The parameters this backend was built with.
    pub fn config(&self) -> BackendConfig {
        match self {
            MapBackend::Occupancy(m) => BackendConfig::Occupancy(*m.params()),
            MapBackend::Ndt(g) => BackendConfig::Ndt(*g.params()),
            MapBackend::OccupancyNdt(g) => BackendConfig::OccupancyNdt(*g.params()),
        }
    }

    pub fn resolution(&self) -> f64 {
        match self {
            MapBackend::Occupancy(m) => m.resolution(),
            MapBackend::Ndt(g) => g.resolution(),
            MapBackend::OccupancyNdt(g) => g.resolution(),
        }
    }

    pub fn cell_count(&self) -> usize {
        match self {
            MapBackend::Occupancy(m) => m.len(),
            MapBackend::Ndt(g) => g.len(),
            MapBackend::OccupancyNdt(g) => g.len(),
        }
    }

    pub fn insert_stats(&self) -> &InsertStats {
        match self {
            MapBackend::Occupancy(m) => m.insert_stats(),
            MapBackend::Ndt(g) => g.insert_stats(),
            MapBackend::OccupancyNdt(g) => g.insert_stats(),
        }
    }

    /// Fuse `points` (map frame) observed from `origin`.
    pub fn insert(&mut self, points: &[Point3], origin: Point3) {
        match self {
            MapBackend::Occupancy(m) => m.insert(points, origin),
            MapBackend::Ndt(g) => g.insert(points, origin),
            MapBackend::OccupancyNdt(g) => g.insert(points, origin),
        }
    }

    /// Bring derived aggregates up to date.
    pub fn refresh(&mut self) {
        match self {
            MapBackend::Occupancy(m) => m.refresh(),
            MapBackend::Ndt(g) => g.refresh(),
            MapBackend::OccupancyNdt(g) => g.refresh(),
        }
    }

    /// Refresh, then copy the backend into an immutable snapshot.
    pub fn export_snapshot(&mut self) -> MapSnapshot {
        self.refresh();
        let kind = self.kind();
        let resolution = self.resolution();
        let stats = self.insert_stats().clone();
        match self {
            MapBackend::Occupancy(m) => MapSnapshot::new(
                kind,
                resolution,
                Some(m.params().occupied_threshold),
                m.snapshot_cells(),
                m.bounds(),
                stats,
            ),
            MapBackend::Ndt(g) => MapSnapshot::new(kind, resolution, None, g.snapshot_cells(), g.bounds(), stats),
            MapBackend::OccupancyNdt(g) => MapSnapshot::new(
                kind,
                resolution,
                Some(g.params().occupied_threshold),
                g.snapshot_cells(),
                g.bounds(),
                stats,
            ),
        }
    }

    pub fn payload_file_name(&self) -> &'static str {
        self.kind().payload_file_name()
    }

    /// Encode every cell into `w`.
    pub fn write_payload<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        codec::write_backend(self, w)
    }

    /// Decode a payload previously produced by [`write_payload`][Self::write_payload].
    pub fn read_payload<R: Read>(config: &BackendConfig, r: &mut R) -> Result<Self, MapsError> {
        codec::read_backend(config, r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::VoxelKey;

    #[test]
    fn config_parses_tagged_table() {
        let cfg: BackendConfig = toml::from_str(
            r#"
            kind = "occupancy_ndt"
            resolution = 0.25
            "#,
        )
        .unwrap();
        match cfg {
            BackendConfig::OccupancyNdt(p) => {
                assert_eq!(p.resolution, 0.25);
                assert_eq!(p.prob_hit, 0.7);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn config_round_trips_through_toml() {
        let cfg = BackendConfig::Ndt(NdtParams { resolution: 2.0 });
        let text = toml::to_string(&cfg).unwrap();
        assert!(text.contains("kind = \"ndt\""));
        let back: BackendConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn build_rejects_bad_resolution() {
        let cfg = BackendConfig::Ndt(NdtParams { resolution: -1.0 });
        assert!(matches!(MapBackend::build(&cfg), Err(MapsError::InvalidParams(_))));
    }

    #[test]
    fn kind_and_payload_names() {
        for (cfg, name) in [
            (BackendConfig::default(), "occupancy.bin"),
            (BackendConfig::Ndt(NdtParams::default()), "ndt.bin"),
            (BackendConfig::OccupancyNdt(OccupancyParams::default()), "ndt.bin"),
        ] {
            let backend = MapBackend::build(&cfg).unwrap();
            assert_eq!(backend.kind(), cfg.kind());
            assert_eq!(backend.config(), cfg);
            assert_eq!(backend.payload_file_name(), name);
        }
    }

    #[test]
    fn snapshot_is_detached_from_backend() {
        let mut backend = MapBackend::build(&BackendConfig::default()).unwrap();
        backend.insert(&[Point3::new(2.5, 0.5, 0.5)], Point3::new(0.5, 0.5, 0.5));
        let snap = backend.export_snapshot();
        backend.insert(&[Point3::new(0.5, 4.5, 0.5)], Point3::new(0.5, 0.5, 0.5));

        assert_eq!(snap.insert_stats().insertions, 1);
        assert_eq!(snap.occupied_cells(), vec![VoxelKey::new(2, 0, 0)]);
        assert!(snap.occupancy_at(Point3::new(0.5, 4.5, 0.5)).is_none());
        assert!(snap.occupancy_at(Point3::new(1.5, 0.5, 0.5)).unwrap() < 0.5);
        assert_eq!(backend.export_snapshot().occupied_cells().len(), 2);
    }

    #[test]
    fn ndt_snapshot_exposes_distributions() {
        let mut backend = MapBackend::build(&BackendConfig::Ndt(NdtParams::default())).unwrap();
        backend.insert(
            &[
                Point3::new(0.1, 0.2, 0.3),
                Point3::new(0.8, 0.1, 0.5),
                Point3::new(0.4, 0.9, 0.2),
                Point3::new(0.5, 0.5, 0.9),
            ],
            Point3::origin(),
        );
        let snap = backend.export_snapshot();
        assert_eq!(snap.cell_count(), 1);
        let d = snap.distribution_at(Point3::new(0.5, 0.5, 0.5)).unwrap();
        assert_eq!(d.count, 4);
        assert!(!d.degenerate);
        assert!(snap.occupancy_at(Point3::new(0.5, 0.5, 0.5)).is_none());
        assert_eq!(snap.occupied_cells(), vec![VoxelKey::new(0, 0, 0)]);
    }
}
