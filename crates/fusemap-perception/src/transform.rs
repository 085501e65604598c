//! Rigid-body transforms.
//!
//! A [`Transform3D`] is a rotation (unit [`Quaternion`]) followed by a
//! translation.  It maps points expressed in a child frame (e.g. `"laser"`)
//! into its parent frame (e.g. `"map"`).
//!
//! # Example
//!
//! ```rust
//! use fusemap_perception::transform::{Quaternion, Transform3D};
//! use fusemap_types::Point3;
//!
//! // The sensor sits 1 m ahead of the map origin, yawed by 90°.
//! let map_t_laser = Transform3D::new(
//!     Point3::new(1.0, 0.0, 0.0),
//!     Quaternion::from_axis_angle(Point3::new(0.0, 0.0, 1.0), std::f64::consts::FRAC_PI_2),
//! );
//!
//! let p = map_t_laser.apply(Point3::new(1.0, 0.0, 0.0));
//! assert!((p.x - 1.0).abs() < 1e-9);
//! assert!((p.y - 1.0).abs() < 1e-9);
//! ```

use fusemap_types::Point3;

// ────────────────────────────────────────────────────────────────────────────
// Quaternion
// ────────────────────────────────────────────────────────────────────────────

/// A unit quaternion representing a 3-D rotation (w, x, y, z convention).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    /// Create a quaternion.  The caller is responsible for providing a unit
    /// quaternion (|q| = 1); use [`normalized`][Self::normalized] otherwise.
    pub const fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// The identity rotation (no rotation).
    pub const fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Rotation of `angle` radians around `axis` (need not be unit length).
    ///
    /// A zero axis yields the identity.
    pub fn from_axis_angle(axis: Point3, angle: f64) -> Self {
        let n = axis.norm();
        if n < f64::EPSILON {
            return Self::identity();
        }
        let half = angle * 0.5;
        let s = half.sin() / n;
        Self::new(half.cos(), axis.x * s, axis.y * s, axis.z * s)
    }

    pub fn norm(self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Scale to unit length.  A zero quaternion becomes the identity.
    pub fn normalized(self) -> Self {
        let n = self.norm();
        if n < f64::EPSILON || !n.is_finite() {
            return Self::identity();
        }
        Self::new(self.w / n, self.x / n, self.y / n, self.z / n)
    }

    pub fn dot(self, rhs: Self) -> f64 {
        self.w * rhs.w + self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    /// Hamilton product: compose two rotations.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        )
    }

    /// Conjugate (== inverse for a unit quaternion).
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    /// Rotate a vector by this quaternion: p' = q * p * q*.
    pub fn rotate(self, v: Point3) -> Point3 {
        let p = Self::new(0.0, v.x, v.y, v.z);
        let rotated = self.mul(p).mul(self.conjugate());
        Point3::new(rotated.x, rotated.y, rotated.z)
    }

    /// Spherical linear interpolation from `self` (`alpha = 0`) to `other`
    /// (`alpha = 1`) along the shortest arc.
    pub fn slerp(self, other: Self, alpha: f64) -> Self {
        let mut other = other;
        let mut cos_theta = self.dot(other);
        // q and -q encode the same rotation; take the short way round.
        if cos_theta < 0.0 {
            other = Self::new(-other.w, -other.x, -other.y, -other.z);
            cos_theta = -cos_theta;
        }

        let (wa, wb) = if cos_theta > 0.9995 {
            (1.0 - alpha, alpha)
        } else {
            let theta = cos_theta.acos();
            let sin_theta = theta.sin();
            (
                ((1.0 - alpha) * theta).sin() / sin_theta,
                (alpha * theta).sin() / sin_theta,
            )
        };

        Self::new(
            wa * self.w + wb * other.w,
            wa * self.x + wb * other.x,
            wa * self.y + wb * other.y,
            wa * self.z + wb * other.z,
        )
        .normalized()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transform3D
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body 3-D transform: rotation followed by translation.
///
/// Represents the pose of frame B relative to frame A: to convert a point
/// expressed in frame B into frame A, rotate it by `rotation` then add
/// `translation`.  The translation is therefore the origin of frame B
/// expressed in frame A, which is what the mapper uses as the sensor origin
/// for ray casting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3D {
    pub translation: Point3,
    pub rotation: Quaternion,
}

impl Transform3D {
    pub const fn new(translation: Point3, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// The identity transform (no translation, no rotation).
    pub const fn identity() -> Self {
        Self::new(Point3::origin(), Quaternion::identity())
    }

    pub fn from_translation(translation: Point3) -> Self {
        Self::new(translation, Quaternion::identity())
    }

    /// Map a point from the child frame into the parent frame.
    pub fn apply(&self, p: Point3) -> Point3 {
        self.rotation.rotate(p).add(self.translation)
    }

    /// Compose two transforms: `self` applied first, then `other`.
    ///
    /// If `self` = T_A_B and `other` = T_B_C, the result is T_A_C.
    pub fn compose(self, other: Self) -> Self {
        let translated = self.translation.add(self.rotation.rotate(other.translation));
        let rotated = self.rotation.mul(other.rotation);
        Self::new(translated, rotated)
    }

    /// The inverse transform: T_A_B → T_B_A.
    pub fn inverse(self) -> Self {
        let inv_rot = self.rotation.conjugate();
        let inv_trans = inv_rot.rotate(self.translation).scale(-1.0);
        Self::new(inv_trans, inv_rot)
    }

    /// Interpolate between two poses: linear in translation, spherical in
    /// rotation.  `alpha` is clamped to `[0, 1]`.
    pub fn interpolate(self, other: Self, alpha: f64) -> Self {
        let alpha = alpha.clamp(0.0, 1.0);
        let translation = self
            .translation
            .add(other.translation.sub(self.translation).scale(alpha));
        Self::new(translation, self.rotation.slerp(other.rotation, alpha))
    }

    /// True when every component of the transform is finite.
    pub fn is_finite(&self) -> bool {
        self.translation.is_finite()
            && self.rotation.w.is_finite()
            && self.rotation.x.is_finite()
            && self.rotation.y.is_finite()
            && self.rotation.z.is_finite()
    }
}

impl Default for Transform3D {
    fn default() -> Self {
        Self::identity()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_1_SQRT_2, FRAC_PI_2, PI};

    fn close(a: Point3, b: Point3) -> bool {
        a.sub(b).norm() < 1e-9
    }

    fn yaw(angle: f64) -> Quaternion {
        Quaternion::from_axis_angle(Point3::new(0.0, 0.0, 1.0), angle)
    }

    // ── Quaternion ──────────────────────────────────────────────────────────

    #[test]
    fn quaternion_identity_rotate_is_noop() {
        let v = Point3::new(1.0, 2.0, 3.0);
        assert!(close(Quaternion::identity().rotate(v), v));
    }

    #[test]
    fn quaternion_90deg_yaw_rotates_x_to_y() {
        let q = Quaternion::new(FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2);
        let r = q.rotate(Point3::new(1.0, 0.0, 0.0));
        assert!(close(r, Point3::new(0.0, 1.0, 0.0)), "got {r:?}");
    }

    #[test]
    fn axis_angle_matches_explicit_quaternion() {
        let q = yaw(FRAC_PI_2);
        assert!((q.w - FRAC_1_SQRT_2).abs() < 1e-12);
        assert!((q.z - FRAC_1_SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn normalized_zero_quaternion_is_identity() {
        assert_eq!(Quaternion::new(0.0, 0.0, 0.0, 0.0).normalized(), Quaternion::identity());
    }

    #[test]
    fn slerp_halfway_between_yaws() {
        let q = yaw(0.0).slerp(yaw(FRAC_PI_2), 0.5);
        let r = q.rotate(Point3::new(1.0, 0.0, 0.0));
        let expected = yaw(PI / 4.0).rotate(Point3::new(1.0, 0.0, 0.0));
        assert!(close(r, expected), "got {r:?}");
    }

    #[test]
    fn slerp_takes_shortest_arc() {
        let a = yaw(0.1);
        let b = yaw(-0.1);
        let neg_b = Quaternion::new(-b.w, -b.x, -b.y, -b.z);
        let mid = a.slerp(neg_b, 0.5);
        let r = mid.rotate(Point3::new(1.0, 0.0, 0.0));
        assert!(close(r, Point3::new(1.0, 0.0, 0.0)), "got {r:?}");
    }

    // ── Transform3D ─────────────────────────────────────────────────────────

    #[test]
    fn transform_compose_translations_add() {
        let t1 = Transform3D::from_translation(Point3::new(1.0, 0.0, 0.0));
        let t2 = Transform3D::from_translation(Point3::new(2.0, 0.0, 0.0));
        assert!(close(t1.compose(t2).translation, Point3::new(3.0, 0.0, 0.0)));
    }

    #[test]
    fn transform_compose_respects_rotation() {
        // robot_base at origin yawed 90°, sensor 1 m ahead in base frame.
        let world_t_base = Transform3D::new(Point3::origin(), yaw(FRAC_PI_2));
        let base_t_sensor = Transform3D::from_translation(Point3::new(1.0, 0.0, 0.0));
        let world_t_sensor = world_t_base.compose(base_t_sensor);
        assert!(close(world_t_sensor.translation, Point3::new(0.0, 1.0, 0.0)));
    }

    #[test]
    fn inverse_composes_to_identity() {
        let t = Transform3D::new(Point3::new(1.0, -2.0, 0.5), yaw(0.7));
        let id = t.compose(t.inverse());
        assert!(close(id.translation, Point3::origin()));
        let p = Point3::new(3.0, 4.0, 5.0);
        assert!(close(t.inverse().apply(t.apply(p)), p));
    }

    #[test]
    fn interpolate_midpoint() {
        let a = Transform3D::new(Point3::new(0.0, 0.0, 0.0), yaw(0.0));
        let b = Transform3D::new(Point3::new(2.0, 4.0, 0.0), yaw(FRAC_PI_2));
        let m = a.interpolate(b, 0.5);
        assert!(close(m.translation, Point3::new(1.0, 2.0, 0.0)));
        let r = m.rotation.rotate(Point3::new(1.0, 0.0, 0.0));
        assert!(close(r, yaw(PI / 4.0).rotate(Point3::new(1.0, 0.0, 0.0))));
    }

    #[test]
    fn non_finite_transform_detected() {
        let t = Transform3D::from_translation(Point3::new(f64::NAN, 0.0, 0.0));
        assert!(!t.is_finite());
        assert!(Transform3D::identity().is_finite());
    }
}
