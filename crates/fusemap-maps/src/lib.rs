//! `fusemap-maps` – spatial map representations.
//!
//! All backends share the same cell addressing ([`voxel`]) and expose the
//! same small surface through the closed [`MapBackend`] enum: insert a scan,
//! refresh derived aggregates, export a [`MapSnapshot`], and encode or decode
//! a binary payload.
//!
//! # Modules
//!
//! - [`voxel`] – [`VoxelKey`] cell coordinates and [`Aabb`] bounds.
//! - [`raycast`] – [`RayKeys`][raycast::RayKeys]: the cells a sensor ray
//!   crosses before its endpoint.
//! - [`occupancy`] – [`OccupancyVolume`]: log-odds occupancy per cell.
//! - [`ndt`] – [`NdtGrid`]: running mean and covariance per cell.
//! - [`ndt_occupancy`] – [`OccupancyNdtGrid`]: both of the above.
//! - [`backend`] – [`BackendKind`], [`BackendConfig`], [`MapBackend`].
//! - [`snapshot`] – [`MapSnapshot`] and [`InsertStats`].
//! - [`codec`] – the little-endian payload format.
//!
//! # Backends
//!
//! | Kind            | Cell state                          | Payload         |
//! |-----------------|-------------------------------------|-----------------|
//! | `occupancy`     | log-odds                            | `occupancy.bin` |
//! | `ndt`           | count, mean, scatter                | `ndt.bin`       |
//! | `occupancy_ndt` | count, mean, scatter, log-odds      | `ndt.bin`       |

pub mod backend;
pub mod codec;
pub mod error;
pub mod ndt;
pub mod ndt_occupancy;
pub mod occupancy;
pub mod raycast;
pub mod snapshot;
pub mod voxel;

pub use backend::{BackendConfig, BackendKind, MapBackend};
pub use error::{CodecError, MapsError};
pub use ndt::{Distribution, NdtGrid, NdtParams};
pub use ndt_occupancy::OccupancyNdtGrid;
pub use occupancy::{OccupancyParams, OccupancyVolume};
pub use snapshot::{CellDistribution, CellSnapshot, InsertStats, MapSnapshot};
pub use voxel::{Aabb, VoxelKey};
