//! Binary payload format.
//!
//! ```text
//! header   magic "FMAP" | version u16 | kind u8 | reserved u8 | resolution f64 | cells u64
//! records  occupancy      key (3 × i32) | log_odds f32
//!          ndt            key | n u64 | mean (3 × f64) | scatter (6 × f64)
//!          occupancy_ndt  ndt record | log_odds f32 | hits u32 | misses u32
//! ```
//!
//! All values are little-endian.  Parameters other than the resolution live
//! in the `map.toml` descriptor written next to the payload.

use std::io::{Read, Write};

use fusemap_types::Point3;
use tracing::debug;

use crate::backend::{BackendConfig, BackendKind, MapBackend};
use crate::error::{CodecError, MapsError};
use crate::ndt::{Distribution, NdtGrid};
use crate::ndt_occupancy::{OccupancyNdtGrid, WeightedCell};
use crate::occupancy::OccupancyVolume;
use crate::voxel::VoxelKey;

/// Magic bytes identifying a payload file.
pub const PAYLOAD_MAGIC: [u8; 4] = *b"FMAP";

/// Current payload version.
pub const PAYLOAD_VERSION: u16 = 1;

/// Payload header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayloadHeader {
    pub kind: BackendKind,
    pub resolution: f64,
    pub cells: u64,
}

impl PayloadHeader {
    fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&PAYLOAD_MAGIC)?;
        w.write_all(&PAYLOAD_VERSION.to_le_bytes())?;
        w.write_all(&[self.kind.tag(), 0])?;
        w.write_all(&self.resolution.to_le_bytes())?;
        w.write_all(&self.cells.to_le_bytes())?;
        Ok(())
    }

    /// Read and validate a header.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        let magic: [u8; 4] = read_array(r)?;
        if magic != PAYLOAD_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let version = u16::from_le_bytes(read_array(r)?);
        if version != PAYLOAD_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let [tag, _reserved] = read_array::<_, 2>(r)?;
        let kind = BackendKind::from_tag(tag).ok_or(CodecError::UnknownKind(tag))?;
        Ok(Self {
            kind,
            resolution: read_f64(r)?,
            cells: read_u64(r)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn write_backend<W: Write>(backend: &MapBackend, w: &mut W) -> std::io::Result<()> {
    PayloadHeader {
        kind: backend.kind(),
        resolution: backend.resolution(),
        cells: backend.cell_count() as u64,
    }
    .write_to(w)?;

    match backend {
        MapBackend::Occupancy(map) => {
            for (key, l) in map.cells() {
                write_key(w, key)?;
                w.write_all(&l.to_le_bytes())?;
            }
        }
        MapBackend::Ndt(grid) => {
            for (key, d) in grid.cells() {
                write_key(w, key)?;
                write_distribution(w, &d)?;
            }
        }
        MapBackend::OccupancyNdt(grid) => {
            for (key, c) in grid.cells() {
                write_key(w, key)?;
                write_distribution(w, &c.distribution)?;
                w.write_all(&c.log_odds.to_le_bytes())?;
                w.write_all(&c.hits.to_le_bytes())?;
                w.write_all(&c.misses.to_le_bytes())?;
            }
        }
    }
    Ok(())
}

fn write_key<W: Write>(w: &mut W, key: VoxelKey) -> std::io::Result<()> {
    w.write_all(&key.x.to_le_bytes())?;
    w.write_all(&key.y.to_le_bytes())?;
    w.write_all(&key.z.to_le_bytes())
}

fn write_distribution<W: Write>(w: &mut W, d: &Distribution) -> std::io::Result<()> {
    w.write_all(&d.count().to_le_bytes())?;
    let mean = d.mean();
    for v in [mean.x, mean.y, mean.z].into_iter().chain(d.scatter()) {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Rebuild a backend from `config` and the payload in `r`.
///
/// The payload's kind must match `config`; its resolution is ignored in
/// favour of the descriptor's.
pub(crate) fn read_backend<R: Read>(config: &BackendConfig, r: &mut R) -> Result<MapBackend, MapsError> {
    let header = PayloadHeader::read_from(r)?;
    if header.kind != config.kind() {
        return Err(CodecError::KindMismatch {
            expected: config.kind(),
            found: header.kind,
        }
        .into());
    }

    let mut backend = MapBackend::build(config)?;
    match &mut backend {
        MapBackend::Occupancy(map) => restore_occupancy(map, header.cells, r)?,
        MapBackend::Ndt(grid) => restore_ndt(grid, header.cells, r)?,
        MapBackend::OccupancyNdt(grid) => restore_weighted(grid, header.cells, r)?,
    }
    backend.refresh();
    debug!(kind = %header.kind, cells = header.cells, "payload decoded");
    Ok(backend)
}

fn restore_occupancy<R: Read>(map: &mut OccupancyVolume, n: u64, r: &mut R) -> Result<(), CodecError> {
    for _ in 0..n {
        let key = read_key(r)?;
        let l = f32::from_le_bytes(read_array(r)?);
        map.restore_cell(key, l);
    }
    Ok(())
}

fn restore_ndt<R: Read>(grid: &mut NdtGrid, n: u64, r: &mut R) -> Result<(), CodecError> {
    for _ in 0..n {
        let key = read_key(r)?;
        grid.restore_cell(key, read_distribution(r)?);
    }
    Ok(())
}

fn restore_weighted<R: Read>(grid: &mut OccupancyNdtGrid, n: u64, r: &mut R) -> Result<(), CodecError> {
    for _ in 0..n {
        let key = read_key(r)?;
        let distribution = read_distribution(r)?;
        let cell = WeightedCell {
            distribution,
            log_odds: f32::from_le_bytes(read_array(r)?),
            hits: u32::from_le_bytes(read_array(r)?),
            misses: u32::from_le_bytes(read_array(r)?),
        };
        grid.restore_cell(key, cell);
    }
    Ok(())
}

fn read_array<R: Read, const N: usize>(r: &mut R) -> std::io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_f64<R: Read>(r: &mut R) -> std::io::Result<f64> {
    Ok(f64::from_le_bytes(read_array(r)?))
}

fn read_u64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    Ok(u64::from_le_bytes(read_array(r)?))
}

fn read_key<R: Read>(r: &mut R) -> std::io::Result<VoxelKey> {
    let x = i32::from_le_bytes(read_array(r)?);
    let y = i32::from_le_bytes(read_array(r)?);
    let z = i32::from_le_bytes(read_array(r)?);
    Ok(VoxelKey::new(x, y, z))
}

fn read_distribution<R: Read>(r: &mut R) -> std::io::Result<Distribution> {
    let n = read_u64(r)?;
    let mean = Point3::new(read_f64(r)?, read_f64(r)?, read_f64(r)?);
    let mut scatter = [0.0; 6];
    for s in &mut scatter {
        *s = read_f64(r)?;
    }
    Ok(Distribution::from_parts(n, mean, scatter))
}
