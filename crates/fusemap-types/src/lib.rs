//! `fusemap-types` – shared data model for the map-fusion workspace.
//!
//! Everything that crosses a crate boundary lives here: the 3-D [`Point3`],
//! the capture [`TimeFrame`] of a measurement, the closed [`SensorData`]
//! variant delivered by sensor drivers, the [`DataItem`] envelope routed to
//! mappers, and the workspace-wide [`MapError`].

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Point3
// ────────────────────────────────────────────────────────────────────────────

/// A point (or free vector) in 3-D space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    /// Create a new point.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The origin `(0, 0, 0)`.
    pub const fn origin() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// True when none of the components is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }

    pub fn scale(self, s: f64) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn dot(self, rhs: Self) -> f64 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    /// Euclidean length of the vector from the origin to this point.
    pub fn norm(self) -> f64 {
        self.dot(self).sqrt()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TimeFrame
// ────────────────────────────────────────────────────────────────────────────

/// The capture interval of a measurement.
///
/// A LiDAR sweep is recorded over a short interval rather than at a single
/// instant.  The **end** of the interval is the authoritative time used when
/// resolving the sensor-to-map transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFrame {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeFrame {
    /// Build a time frame; the bounds are swapped if given in reverse order.
    pub fn new(a: DateTime<Utc>, b: DateTime<Utc>) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    /// A zero-length frame at `t`.
    pub fn instant(t: DateTime<Utc>) -> Self {
        Self { start: t, end: t }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sensor data
// ────────────────────────────────────────────────────────────────────────────

/// The kind of payload carried by a [`DataItem`].
///
/// Mappers declare the set of kinds they consume; the registry routes items
/// by comparing kinds, never by inspecting payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Pointcloud,
    LaserScan,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::Pointcloud => write!(f, "pointcloud"),
            DataKind::LaserScan => write!(f, "laser_scan"),
        }
    }
}

/// A planar range scan, as produced by a 2-D laser range finder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserScan {
    /// Bearing of the first beam (radians, counter-clockwise from +X).
    pub angle_min: f64,
    /// Angular step between consecutive beams (radians).
    pub angle_increment: f64,
    /// Shortest valid range (metres).
    pub range_min: f64,
    /// Longest valid range (metres).
    pub range_max: f64,
    pub ranges: Vec<f64>,
}

impl LaserScan {
    /// Convert the scan into an ordered sequence of sensor-frame points in
    /// the `z = 0` plane.
    ///
    /// Beam order is preserved.  Out-of-range and non-finite readings become
    /// non-finite points so that downstream filtering treats them exactly
    /// like degenerate point-cloud entries.
    pub fn to_points(&self) -> Vec<Point3> {
        self.ranges
            .iter()
            .enumerate()
            .map(|(i, &r)| {
                if !r.is_finite() || r < self.range_min || r > self.range_max {
                    return Point3::new(f64::NAN, f64::NAN, f64::NAN);
                }
                let angle = self.angle_min + self.angle_increment * i as f64;
                Point3::new(r * angle.cos(), r * angle.sin(), 0.0)
            })
            .collect()
    }
}

/// Payload variants accepted by the fusion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorData {
    /// An ordered 3-D point cloud in the sensor frame.  May contain
    /// non-finite entries.
    Pointcloud { points: Vec<Point3> },
    LaserScan(LaserScan),
}

impl SensorData {
    pub fn kind(&self) -> DataKind {
        match self {
            SensorData::Pointcloud { .. } => DataKind::Pointcloud,
            SensorData::LaserScan(_) => DataKind::LaserScan,
        }
    }
}

/// One timestamped sensor measurement, routed to every mapper that accepts
/// its [`DataKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    pub id: Uuid,
    /// Sensor frame the payload is expressed in (e.g. `"laser"`).
    pub frame_id: String,
    pub time_frame: TimeFrame,
    pub data: SensorData,
}

impl DataItem {
    /// Construct a new item with a freshly generated id.
    pub fn new(frame_id: impl Into<String>, time_frame: TimeFrame, data: SensorData) -> Self {
        Self {
            id: Uuid::new_v4(),
            frame_id: frame_id.into(),
            time_frame,
            data,
        }
    }

    /// Convenience constructor for a point cloud captured at a single instant.
    pub fn pointcloud(frame_id: impl Into<String>, stamp: DateTime<Utc>, points: Vec<Point3>) -> Self {
        Self::new(frame_id, TimeFrame::instant(stamp), SensorData::Pointcloud { points })
    }

    pub fn kind(&self) -> DataKind {
        self.data.kind()
    }

    pub fn is_kind(&self, kind: DataKind) -> bool {
        self.kind() == kind
    }

    pub fn frame_id(&self) -> &str {
        &self.frame_id
    }

    pub fn time_frame(&self) -> TimeFrame {
        self.time_frame
    }

    /// Borrow the raw points when this item is a point cloud.
    pub fn as_pointcloud(&self) -> Option<&[Point3]> {
        match &self.data {
            SensorData::Pointcloud { points } => Some(points),
            _ => None,
        }
    }

    /// The payload as an ordered sensor-frame point sequence, whatever its
    /// kind.
    pub fn points(&self) -> Vec<Point3> {
        match &self.data {
            SensorData::Pointcloud { points } => points.clone(),
            SensorData::LaserScan(scan) => scan.to_points(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type for configuration, persistence and codec
/// failures.  Per-frame failures (missing transforms, degenerate points) are
/// not errors; they are reported through processing outcomes.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("Invalid configuration for '{mapper}': {details}")]
    InvalidConfig { mapper: String, details: String },

    #[error("Invalid destination '{}': {reason}", path.display())]
    InvalidDestination { path: PathBuf, reason: String },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Map payload error: {0}")]
    Codec(String),

    #[error("Config parse error: {0}")]
    Config(String),
}

impl MapError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stamp(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn point_finiteness() {
        assert!(Point3::new(1.0, -2.0, 3.0).is_finite());
        assert!(!Point3::new(f64::NAN, 0.0, 0.0).is_finite());
        assert!(!Point3::new(0.0, f64::INFINITY, 0.0).is_finite());
        assert!(!Point3::new(0.0, 0.0, f64::NEG_INFINITY).is_finite());
    }

    #[test]
    fn time_frame_orders_bounds() {
        let tf = TimeFrame::new(stamp(10), stamp(5));
        assert_eq!(tf.start, stamp(5));
        assert_eq!(tf.end, stamp(10));
        assert_eq!(tf.duration().num_seconds(), 5);
    }

    #[test]
    fn laser_scan_converts_beams_in_order() {
        let scan = LaserScan {
            angle_min: 0.0,
            angle_increment: std::f64::consts::FRAC_PI_2,
            range_min: 0.1,
            range_max: 10.0,
            ranges: vec![1.0, 2.0, 50.0, f64::NAN],
        };
        let pts = scan.to_points();
        assert_eq!(pts.len(), 4);
        assert!((pts[0].x - 1.0).abs() < 1e-9);
        assert!(pts[0].y.abs() < 1e-9);
        assert!(pts[1].x.abs() < 1e-9);
        assert!((pts[1].y - 2.0).abs() < 1e-9);
        // Out of range and NaN readings are marked degenerate.
        assert!(!pts[2].is_finite());
        assert!(!pts[3].is_finite());
    }

    #[test]
    fn data_item_kind_and_accessors() {
        let item = DataItem::pointcloud("laser", stamp(1), vec![Point3::origin()]);
        assert_eq!(item.kind(), DataKind::Pointcloud);
        assert!(item.is_kind(DataKind::Pointcloud));
        assert!(!item.is_kind(DataKind::LaserScan));
        assert_eq!(item.frame_id(), "laser");
        assert_eq!(item.as_pointcloud().map(<[Point3]>::len), Some(1));
        assert_eq!(item.time_frame().end, stamp(1));
    }

    #[test]
    fn sensor_data_serializes_with_kind_tag() {
        let data = SensorData::Pointcloud {
            points: vec![Point3::new(1.0, 2.0, 3.0)],
        };
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains("\"kind\":\"pointcloud\""));
        let back: SensorData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn map_error_display_names_path() {
        let err = MapError::InvalidDestination {
            path: PathBuf::from("/tmp/not-a-dir"),
            reason: "not a directory".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/not-a-dir"));
        assert!(msg.contains("not a directory"));
    }
}
