//! `fusemap-perception` – geometry front-end of the fusion pipeline.
//!
//! Turns sensor-frame measurements into clean map-frame points.
//!
//! # Modules
//!
//! - [`transform`] – [`Transform3D`][transform::Transform3D] and
//!   [`Quaternion`][transform::Quaternion]: rigid-body transforms with
//!   composition, inversion and pose interpolation.
//! - [`tf_buffer`] – [`TfBuffer`][tf_buffer::TfBuffer]: time-indexed frame
//!   graph implementing the [`TransformResolver`][tf_buffer::TransformResolver]
//!   contract with bounded, blocking lookups.
//! - [`filter`] – [`PointFilter`][filter::PointFilter]: drops points that are
//!   non-finite before or after transformation.

pub mod filter;
pub mod tf_buffer;
pub mod transform;

pub use filter::{FilteredPoints, PointFilter, PointFilterStats};
pub use tf_buffer::{TfBuffer, TransformError, TransformResolver};
pub use transform::{Quaternion, Transform3D};
