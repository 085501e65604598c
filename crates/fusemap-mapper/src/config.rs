//! Session configuration – reads a `fusemap` TOML file.
//!
//! ```toml
//! map_frame = "map"
//! tf_timeout_ms = 100
//! output_path = "maps"
//!
//! [[mappers]]
//! name = "occupancy"
//! kind = "occupancy"
//! resolution = 0.5
//! accepts = ["pointcloud", "laser_scan"]
//!
//! [[mappers]]
//! name = "ndt"
//! kind = "ndt"
//! map_frame = "odom"
//! ```
//!
//! Missing keys take the defaults below; unknown keys are ignored.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fusemap_maps::{BackendConfig, BackendKind, NdtParams, OccupancyParams};
use fusemap_perception::PointFilter;
use fusemap_types::{DataKind, MapError};
use serde::{Deserialize, Serialize};

/// Top-level session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Frame every mapper fuses into unless it overrides it.
    #[serde(default = "default_map_frame")]
    pub map_frame: String,

    /// Upper bound on a single transform lookup, in milliseconds.
    #[serde(default = "default_tf_timeout_ms")]
    pub tf_timeout_ms: u64,

    /// Root directory for saved maps; each mapper saves into `<root>/<name>/`.
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,

    #[serde(default)]
    pub mappers: Vec<MapperConfig>,
}

/// One `[[mappers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapperConfig {
    pub name: String,

    #[serde(default)]
    pub kind: BackendKind,

    #[serde(default = "default_resolution")]
    pub resolution: f64,

    /// Data kinds this mapper consumes.
    #[serde(default = "default_accepts")]
    pub accepts: Vec<DataKind>,

    /// Overrides [`SessionConfig::map_frame`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_frame: Option<String>,

    /// Overrides [`SessionConfig::tf_timeout_ms`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tf_timeout_ms: Option<u64>,

    // Sensor model overrides for the log-odds backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prob_hit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prob_miss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clamp_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clamp_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupied_threshold: Option<f64>,
    /// Ray truncation length in metres; `<= 0` disables truncation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_range: Option<f64>,

    /// Sensor-frame range gate applied before fusion; unset means no gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_point_range: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_point_range: Option<f64>,
}

fn default_map_frame() -> String {
    "map".to_string()
}
fn default_tf_timeout_ms() -> u64 {
    100
}
fn default_output_path() -> PathBuf {
    PathBuf::from("maps")
}
fn default_resolution() -> f64 {
    1.0
}
fn default_accepts() -> Vec<DataKind> {
    vec![DataKind::Pointcloud]
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            map_frame: default_map_frame(),
            tf_timeout_ms: default_tf_timeout_ms(),
            output_path: default_output_path(),
            mappers: Vec::new(),
        }
    }
}

impl MapperConfig {
    /// A mapper entry with every optional key left at its default.
    pub fn new(name: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            name: name.into(),
            kind,
            resolution: default_resolution(),
            accepts: default_accepts(),
            map_frame: None,
            tf_timeout_ms: None,
            prob_hit: None,
            prob_miss: None,
            clamp_min: None,
            clamp_max: None,
            occupied_threshold: None,
            max_range: None,
            min_point_range: None,
            max_point_range: None,
        }
    }

    /// Backend parameters with overrides applied.  Not validated; the
    /// mapper validates when it builds the backend.
    pub fn backend_config(&self) -> BackendConfig {
        let occupancy = || {
            let d = OccupancyParams::default();
            OccupancyParams {
                resolution: self.resolution,
                prob_hit: self.prob_hit.unwrap_or(d.prob_hit),
                prob_miss: self.prob_miss.unwrap_or(d.prob_miss),
                clamp_min: self.clamp_min.unwrap_or(d.clamp_min),
                clamp_max: self.clamp_max.unwrap_or(d.clamp_max),
                occupied_threshold: self.occupied_threshold.unwrap_or(d.occupied_threshold),
                max_range: self.max_range.unwrap_or(d.max_range),
            }
        };
        match self.kind {
            BackendKind::Occupancy => BackendConfig::Occupancy(occupancy()),
            BackendKind::Ndt => BackendConfig::Ndt(NdtParams {
                resolution: self.resolution,
            }),
            BackendKind::OccupancyNdt => BackendConfig::OccupancyNdt(occupancy()),
        }
    }

    pub fn point_filter(&self) -> PointFilter {
        match (self.min_point_range, self.max_point_range) {
            (None, None) => PointFilter::new(),
            (min, max) => PointFilter::with_range(min.unwrap_or(0.0), max.unwrap_or(0.0)),
        }
    }

    /// Resolve per-mapper overrides against the session defaults.
    pub fn settings(&self, session: &SessionConfig) -> MapperSettings {
        MapperSettings {
            name: self.name.clone(),
            map_frame: self.map_frame.clone().unwrap_or_else(|| session.map_frame.clone()),
            tf_timeout: Duration::from_millis(self.tf_timeout_ms.unwrap_or(session.tf_timeout_ms)),
            accepts: self.accepts.clone(),
            backend: self.backend_config(),
            filter: self.point_filter(),
        }
    }
}

/// Fully resolved settings of one mapper.
#[derive(Debug, Clone, PartialEq)]
pub struct MapperSettings {
    pub name: String,
    pub map_frame: String,
    pub tf_timeout: Duration,
    pub accepts: Vec<DataKind>,
    pub backend: BackendConfig,
    pub filter: PointFilter,
}

impl MapperSettings {
    /// Defaults for a mapper called `name`: `map` frame, 100 ms lookups,
    /// point clouds only.
    pub fn new(name: impl Into<String>, backend: BackendConfig) -> Self {
        Self {
            name: name.into(),
            map_frame: default_map_frame(),
            tf_timeout: Duration::from_millis(default_tf_timeout_ms()),
            accepts: default_accepts(),
            backend,
            filter: PointFilter::new(),
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document and apply `FUSEMAP_*` overrides.
    pub fn from_toml_str(raw: &str) -> Result<Self, MapError> {
        let mut cfg: SessionConfig =
            toml::from_str(raw).map_err(|e| MapError::Config(format!("Failed to parse config: {e}")))?;
        apply_env_overrides(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load the session file at `path`.
    pub fn load_from(path: &Path) -> Result<Self, MapError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            MapError::Config(format!("Failed to read config at {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Structural checks.  Backend parameters are checked at setup.
    pub fn validate(&self) -> Result<(), MapError> {
        let mut seen = HashSet::new();
        for m in &self.mappers {
            if m.name.trim().is_empty() {
                return Err(MapError::Config("mapper name must not be empty".to_string()));
            }
            if m.name.contains(['/', '\\']) || m.name == "." || m.name == ".." {
                return Err(MapError::Config(format!(
                    "mapper name '{}' cannot be used as a directory name",
                    m.name
                )));
            }
            if !seen.insert(m.name.as_str()) {
                return Err(MapError::Config(format!("duplicate mapper name '{}'", m.name)));
            }
        }
        Ok(())
    }

    pub fn tf_timeout(&self) -> Duration {
        Duration::from_millis(self.tf_timeout_ms)
    }
}

/// Apply `FUSEMAP_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FUSEMAP_MAP_FRAME` | `map_frame` |
/// | `FUSEMAP_TF_TIMEOUT_MS` | `tf_timeout_ms` |
/// | `FUSEMAP_OUTPUT_PATH` | `output_path` |
pub fn apply_env_overrides(cfg: &mut SessionConfig) {
    if let Ok(v) = std::env::var("FUSEMAP_MAP_FRAME") {
        cfg.map_frame = v;
    }
    if let Ok(v) = std::env::var("FUSEMAP_TF_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.tf_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("FUSEMAP_OUTPUT_PATH") {
        cfg.output_path = PathBuf::from(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_takes_defaults() {
        let cfg: SessionConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, SessionConfig::default());
        assert_eq!(cfg.map_frame, "map");
        assert_eq!(cfg.tf_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn mapper_entries_parse_with_defaults() {
        let cfg: SessionConfig = toml::from_str(
            r#"
            map_frame = "world"
            some_future_key = true

            [[mappers]]
            name = "occ"

            [[mappers]]
            name = "grid"
            kind = "occupancy_ndt"
            resolution = 0.25
            accepts = ["pointcloud", "laser_scan"]
            tf_timeout_ms = 5
            max_range = 30.0
            "#,
        )
        .unwrap();

        let occ = &cfg.mappers[0];
        assert_eq!(occ.kind, BackendKind::Occupancy);
        assert_eq!(occ.resolution, 1.0);
        assert_eq!(occ.accepts, vec![DataKind::Pointcloud]);

        let grid = cfg.mappers[1].settings(&cfg);
        assert_eq!(grid.map_frame, "world");
        assert_eq!(grid.tf_timeout, Duration::from_millis(5));
        assert_eq!(grid.accepts.len(), 2);
        match grid.backend {
            BackendConfig::OccupancyNdt(p) => {
                assert_eq!(p.resolution, 0.25);
                assert_eq!(p.max_range, 30.0);
                assert_eq!(p.prob_hit, 0.7);
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_a_parse_error() {
        let err = SessionConfig::from_toml_str(
            r#"
            [[mappers]]
            name = "x"
            kind = "octree"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, MapError::Config(_)));
    }

    #[test]
    fn duplicate_and_unsafe_names_are_rejected() {
        let mut cfg = SessionConfig::default();
        cfg.mappers.push(MapperConfig::new("a", BackendKind::Ndt));
        cfg.mappers.push(MapperConfig::new("a", BackendKind::Occupancy));
        assert!(cfg.validate().is_err());

        cfg.mappers.pop();
        cfg.mappers.push(MapperConfig::new("../escape", BackendKind::Occupancy));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_resolution_survives_parsing() {
        // Rejected later by setup, not by the loader.
        let cfg = SessionConfig::from_toml_str(
            r#"
            [[mappers]]
            name = "bad"
            resolution = -0.5
            "#,
        )
        .unwrap();
        assert!(cfg.mappers[0].backend_config().validate().is_err());
    }

    #[test]
    fn point_range_gate_is_optional() {
        let mut m = MapperConfig::new("m", BackendKind::Occupancy);
        assert_eq!(m.point_filter(), PointFilter::new());
        m.max_point_range = Some(10.0);
        assert_eq!(m.point_filter(), PointFilter::with_range(0.0, 10.0));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("session.toml");
        fs::write(&path, "output_path = \"out\"\n[[mappers]]\nname = \"m\"\n").unwrap();
        let cfg = SessionConfig::load_from(&path).unwrap();
        assert_eq!(cfg.mappers.len(), 1);
        assert!(SessionConfig::load_from(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn apply_env_overrides_changes_tf_timeout() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("FUSEMAP_TF_TIMEOUT_MS", "250") };
        let mut cfg = SessionConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.tf_timeout_ms, 250);
        unsafe { std::env::set_var("FUSEMAP_TF_TIMEOUT_MS", "soon") };
        let mut cfg = SessionConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.tf_timeout_ms, 100);
        unsafe { std::env::remove_var("FUSEMAP_TF_TIMEOUT_MS") };
    }
}
