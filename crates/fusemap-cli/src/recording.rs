//! JSON-lines recordings replayed by the `fusemap` binary.
//!
//! Each non-empty line is one record:
//!
//! ```text
//! {"type":"transform","parent":"map","child":"laser","stamp":"2024-01-01T00:00:00Z",
//!  "translation":[1.0,0.0,0.5],"rotation":[1.0,0.0,0.0,0.0]}
//! {"type":"transform","parent":"base","child":"laser","static":true,"translation":[0.2,0.0,0.3]}
//! {"type":"scan","frame_id":"laser","stamp":"2024-01-01T00:00:00Z",
//!  "data":{"kind":"pointcloud","points":[{"x":1.0,"y":0.0,"z":0.0}]}}
//! ```
//!
//! Lines starting with `#` are comments.

use std::io::BufRead;

use chrono::{DateTime, Utc};
use fusemap_perception::{Quaternion, Transform3D};
use fusemap_types::{DataItem, Point3, SensorData, TimeFrame};
use serde::Deserialize;

/// One line of a recording.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Transform(TransformRecord),
    Scan(ScanRecord),
}

/// A pose of `child` in `parent`.  Static records carry no stamp.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransformRecord {
    pub parent: String,
    pub child: String,
    #[serde(default)]
    pub stamp: Option<DateTime<Utc>>,
    pub translation: [f64; 3],
    /// `[w, x, y, z]`; normalized on use.
    #[serde(default = "identity_rotation")]
    pub rotation: [f64; 4],
    #[serde(default, rename = "static")]
    pub is_static: bool,
}

fn identity_rotation() -> [f64; 4] {
    [1.0, 0.0, 0.0, 0.0]
}

impl TransformRecord {
    pub fn transform(&self) -> Result<Transform3D, String> {
        let [x, y, z] = self.translation;
        let [qw, qx, qy, qz] = self.rotation;
        if !self.translation.iter().chain(self.rotation.iter()).all(|v| v.is_finite()) {
            return Err(format!("{} -> {}: non-finite transform", self.parent, self.child));
        }
        let rotation = Quaternion::new(qw, qx, qy, qz);
        if rotation.norm() < f64::EPSILON {
            return Err(format!("{} -> {}: zero rotation quaternion", self.parent, self.child));
        }
        Ok(Transform3D::new(Point3::new(x, y, z), rotation.normalized()))
    }
}

/// A sensor frame.  `end` defaults to `stamp` for instantaneous captures.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScanRecord {
    pub frame_id: String,
    pub stamp: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    pub data: SensorData,
}

impl ScanRecord {
    pub fn into_item(self) -> DataItem {
        let time_frame = TimeFrame::new(self.stamp, self.end.unwrap_or(self.stamp));
        DataItem::new(self.frame_id, time_frame, self.data)
    }
}

/// Parse one line.  Blank lines and comments yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Record>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let record: Record = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if let Record::Transform(t) = &record
        && !t.is_static
        && t.stamp.is_none()
    {
        return Err(format!("{} -> {}: dynamic transform without stamp", t.parent, t.child));
    }
    Ok(Some(record))
}

/// Iterate the records of `reader`, tagging errors with their line number.
pub fn records<R: BufRead>(reader: R) -> impl Iterator<Item = Result<Record, String>> {
    reader.lines().enumerate().filter_map(|(i, line)| {
        let parsed = line
            .map_err(|e| e.to_string())
            .and_then(|l| parse_line(&l))
            .map_err(|e| format!("line {}: {e}", i + 1));
        parsed.transpose()
    })
}
