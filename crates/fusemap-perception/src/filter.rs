//! Degenerate-geometry filter applied to every incoming frame.
//!
//! Each point is checked twice: once in the sensor frame and once after it
//! has been mapped into the map frame.  The second check catches overflow or
//! NaN propagation introduced by the transform itself (near-singular
//! rotations, values close to `f64::MAX`).  Optional range gates are measured
//! in the sensor frame.

use fusemap_types::Point3;

use crate::transform::Transform3D;

/// Per-frame filter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointFilterStats {
    pub accepted: usize,
    /// Non-finite before the transform.
    pub rejected_sensor: usize,
    /// Finite in the sensor frame but non-finite after the transform.
    pub rejected_map: usize,
    /// Outside the configured `[min_range, max_range]` gate.
    pub rejected_range: usize,
}

impl PointFilterStats {
    pub fn rejected(&self) -> usize {
        self.rejected_sensor + self.rejected_map + self.rejected_range
    }
}

/// Result of [`PointFilter::apply`]: the surviving map-frame points, in input
/// order, plus counters.
#[derive(Debug, Clone, Default)]
pub struct FilteredPoints {
    pub points: Vec<Point3>,
    pub stats: PointFilterStats,
}

/// Drops non-finite points and, optionally, points outside a range gate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointFilter {
    min_range: Option<f64>,
    max_range: Option<f64>,
}

impl PointFilter {
    /// A filter that only drops non-finite points.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also drop points closer than `min_range` or farther than `max_range`
    /// from the sensor.  Non-positive or non-finite bounds disable that side
    /// of the gate.
    pub fn with_range(min_range: f64, max_range: f64) -> Self {
        let gate = |v: f64| (v.is_finite() && v > 0.0).then_some(v);
        Self {
            min_range: gate(min_range),
            max_range: gate(max_range),
        }
    }

    /// Transform `points` into the map frame, keeping only points that are
    /// finite on both sides of the transform and inside the range gate.
    pub fn apply(&self, points: &[Point3], transform: &Transform3D) -> FilteredPoints {
        let mut out = FilteredPoints {
            points: Vec::with_capacity(points.len()),
            stats: PointFilterStats::default(),
        };

        for p in points {
            if !p.is_finite() {
                out.stats.rejected_sensor += 1;
                continue;
            }
            if !self.in_range(p) {
                out.stats.rejected_range += 1;
                continue;
            }
            let mapped = transform.apply(*p);
            if !mapped.is_finite() {
                out.stats.rejected_map += 1;
                continue;
            }
            out.points.push(mapped);
        }

        out.stats.accepted = out.points.len();
        out
    }

    fn in_range(&self, p: &Point3) -> bool {
        let r = p.norm();
        self.min_range.is_none_or(|min| r >= min) && self.max_range.is_none_or(|max| r <= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Quaternion;
    use proptest::prelude::*;

    #[test]
    fn drops_nan_and_infinite_points() {
        let pts = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.0),
            Point3::new(f64::NAN, 0.0, 0.0),
            Point3::new(0.0, f64::INFINITY, 0.0),
        ];
        let out = PointFilter::new().apply(&pts, &Transform3D::identity());
        assert_eq!(out.points, vec![pts[0], pts[1]]);
        assert_eq!(out.stats.accepted, 2);
        assert_eq!(out.stats.rejected_sensor, 2);
        assert_eq!(out.stats.rejected(), 2);
    }

    #[test]
    fn drops_points_that_overflow_after_transform() {
        let big = Transform3D::from_translation(Point3::new(f64::MAX, 0.0, 0.0));
        let pts = [Point3::new(f64::MAX, 0.0, 0.0), Point3::new(-1.0, 0.0, 0.0)];
        let out = PointFilter::new().apply(&pts, &big);
        assert_eq!(out.stats.rejected_map, 1);
        assert_eq!(out.points.len(), 1);
    }

    #[test]
    fn applies_transform_in_order() {
        let t = Transform3D::new(Point3::new(1.0, 2.0, 3.0), Quaternion::identity());
        let pts = [Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        let out = PointFilter::new().apply(&pts, &t);
        assert_eq!(out.points[0], Point3::new(1.0, 2.0, 3.0));
        assert_eq!(out.points[1], Point3::new(2.0, 2.0, 3.0));
    }

    #[test]
    fn range_gate_measured_in_sensor_frame() {
        let far = Transform3D::from_translation(Point3::new(100.0, 0.0, 0.0));
        let pts = [
            Point3::new(0.05, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(20.0, 0.0, 0.0),
        ];
        let out = PointFilter::with_range(0.1, 10.0).apply(&pts, &far);
        assert_eq!(out.points, vec![Point3::new(101.0, 0.0, 0.0)]);
        assert_eq!(out.stats.rejected_range, 2);
    }

    #[test]
    fn non_positive_bounds_disable_gate() {
        let f = PointFilter::with_range(0.0, -1.0);
        assert_eq!(f, PointFilter::new());
    }

    fn coord() -> impl Strategy<Value = f64> {
        prop_oneof![
            8 => -1.0e3..1.0e3f64,
            1 => Just(f64::NAN),
            1 => Just(f64::INFINITY),
            1 => Just(f64::NEG_INFINITY),
        ]
    }

    proptest! {
        #[test]
        fn output_is_finite_image_of_finite_input(
            raw in prop::collection::vec((coord(), coord(), coord()), 0..64),
            tx in -50.0..50.0f64,
            yaw in -3.2..3.2f64,
        ) {
            let pts: Vec<Point3> = raw.iter().map(|&(x, y, z)| Point3::new(x, y, z)).collect();
            let t = Transform3D::new(
                Point3::new(tx, 0.0, 0.0),
                Quaternion::from_axis_angle(Point3::new(0.0, 0.0, 1.0), yaw),
            );
            let out = PointFilter::new().apply(&pts, &t);

            let expected: Vec<Point3> = pts
                .iter()
                .filter(|p| p.is_finite())
                .map(|p| t.apply(*p))
                .collect();
            prop_assert_eq!(&out.points, &expected);
            prop_assert!(out.points.iter().all(Point3::is_finite));
            prop_assert_eq!(out.stats.accepted + out.stats.rejected(), pts.len());
        }
    }
}
