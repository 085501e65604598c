//! `fusemap-mapper` – the incremental map-fusion pipeline.
//!
//! # Architecture
//!
//! ```text
//!  DataItem ──► MapRegistry::dispatch ──► FusionMapper::process (one per accepting mapper)
//!                                             │
//!                    TransformResolver ◄──────┤ lookup(map_frame, frame_id, stamp, timeout)
//!                                             │
//!                          PointFilter ◄──────┤ finite / range checks
//!                                             │
//!                           MapBackend ◄──────┘ insert(points, sensor origin)  [arrival order]
//! ```
//!
//! # Modules
//!
//! - [`config`] – [`SessionConfig`] / [`MapperConfig`] loaded from TOML with
//!   `FUSEMAP_*` environment overrides.
//! - [`mapper`] – [`FusionMapper`]: setup, process, blocking `get_map`, save.
//! - [`registry`] – [`MapRegistry`]: config-driven construction and fan-out.
//! - [`persist`] – `map.toml` descriptor plus payload, atomic writes, load.
//! - [`telemetry`] – `tracing` subscriber and optional OTLP export.

pub mod config;
pub mod mapper;
pub mod persist;
pub mod registry;
pub mod telemetry;

pub use config::{MapperConfig, MapperSettings, SessionConfig};
pub use mapper::{DropReason, FrameTiming, FusionMapper, MapperStats, ProcessOutcome, SaveOutcome};
pub use persist::MapDescriptor;
pub use registry::MapRegistry;
