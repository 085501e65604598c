//! On-disk map layout.
//!
//! A saved map is a directory holding two files:
//!
//! | File | Content |
//! |---|---|
//! | `map.toml` | [`MapDescriptor`]: format version, frame, backend parameters, cell count, timestamp. |
//! | `occupancy.bin` / `ndt.bin` | The backend payload (see `fusemap_maps::codec`). |
//!
//! Both files are first written in full to temporary files in the target
//! directory.  Only once both are staged are they renamed into place, payload
//! first, so a failed save leaves the previous map untouched and `map.toml`
//! only ever points at a complete payload.

use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fusemap_maps::{BackendConfig, BackendKind, MapBackend};
use fusemap_types::MapError;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

/// Name of the descriptor file inside a map directory.
pub const DESCRIPTOR_FILE: &str = "map.toml";

/// Current descriptor format.
pub const FORMAT_VERSION: u32 = 1;

/// Contents of `map.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapDescriptor {
    pub format_version: u32,
    pub map_frame: String,
    /// File name of the payload, relative to the map directory.
    pub payload: String,
    pub cell_count: u64,
    /// Number of frames fused into the map before it was saved.
    pub insertions: u64,
    pub saved_at: DateTime<Utc>,
    /// Must stay last: TOML tables follow plain keys.
    pub backend: BackendConfig,
}

impl MapDescriptor {
    pub fn describe(map_frame: &str, backend: &MapBackend) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            map_frame: map_frame.to_string(),
            payload: backend.payload_file_name().to_string(),
            cell_count: backend.cell_count() as u64,
            insertions: backend.insert_stats().insertions,
            saved_at: Utc::now(),
            backend: backend.config(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }
}

/// Make sure `dir` is a directory we can write into, creating it if needed.
fn prepare_destination(dir: &Path) -> Result<(), MapError> {
    match fs::metadata(dir) {
        Ok(meta) if !meta.is_dir() => {
            return Err(MapError::InvalidDestination {
                path: dir.to_path_buf(),
                reason: "exists and is not a directory".to_string(),
            });
        }
        Ok(meta) if meta.permissions().readonly() => {
            return Err(MapError::InvalidDestination {
                path: dir.to_path_buf(),
                reason: "directory is read-only".to_string(),
            });
        }
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(|e| MapError::InvalidDestination {
                path: dir.to_path_buf(),
                reason: format!("cannot create directory: {e}"),
            })?;
        }
        Err(e) => return Err(MapError::io(dir, e)),
    }
    Ok(())
}

/// A file fully written to a temporary path, waiting to be renamed.
struct Staged {
    tmp: NamedTempFile,
    target: PathBuf,
}

/// Write `bytes` to a temporary file in `dir`, destined for `dir/name`.
fn stage(dir: &Path, name: &str, bytes: &[u8]) -> Result<Staged, MapError> {
    let target = dir.join(name);
    if fs::symlink_metadata(&target).is_ok_and(|m| m.is_dir()) {
        return Err(MapError::InvalidDestination {
            path: target,
            reason: "a directory is in the way".to_string(),
        });
    }
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => MapError::InvalidDestination {
            path: dir.to_path_buf(),
            reason: "directory is not writable".to_string(),
        },
        _ => MapError::io(dir, e),
    })?;
    tmp.write_all(bytes).map_err(|e| MapError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| MapError::io(tmp.path(), e))?;
    Ok(Staged { tmp, target })
}

impl Staged {
    fn commit(self) -> Result<(), MapError> {
        let Staged { tmp, target } = self;
        tmp.persist(&target).map_err(|e| MapError::io(&target, e.error))?;
        debug!(path = %target.display(), "file written");
        Ok(())
    }
}

/// Write an encoded payload and its descriptor into `dir`.
pub fn write_map(dir: &Path, descriptor: &MapDescriptor, payload: &[u8]) -> Result<(), MapError> {
    prepare_destination(dir)?;
    let text = toml::to_string_pretty(descriptor)
        .map_err(|e| MapError::Codec(format!("Failed to serialize descriptor: {e}")))?;
    let payload = stage(dir, &descriptor.payload, payload)?;
    let descriptor = stage(dir, DESCRIPTOR_FILE, text.as_bytes())?;
    payload.commit()?;
    descriptor.commit()
}

/// Read the descriptor of the map saved in `dir`.
pub fn read_descriptor(dir: &Path) -> Result<MapDescriptor, MapError> {
    let path = dir.join(DESCRIPTOR_FILE);
    let raw = fs::read_to_string(&path).map_err(|e| MapError::io(&path, e))?;
    let descriptor: MapDescriptor = toml::from_str(&raw)
        .map_err(|e| MapError::Codec(format!("Failed to parse {}: {e}", path.display())))?;
    if descriptor.format_version != FORMAT_VERSION {
        return Err(MapError::Codec(format!(
            "unsupported map format version {}",
            descriptor.format_version
        )));
    }
    Ok(descriptor)
}

/// Load the map saved in `dir`.
pub fn load(dir: &Path) -> Result<(MapDescriptor, MapBackend), MapError> {
    let descriptor = read_descriptor(dir)?;
    let path = dir.join(&descriptor.payload);
    let file = File::open(&path).map_err(|e| MapError::io(&path, e))?;
    let backend = MapBackend::read_payload(&descriptor.backend, &mut BufReader::new(file))
        .map_err(|e| MapError::Codec(format!("{}: {e}", path.display())))?;
    if backend.cell_count() as u64 != descriptor.cell_count {
        return Err(MapError::Codec(format!(
            "{} holds {} cells, descriptor says {}",
            path.display(),
            backend.cell_count(),
            descriptor.cell_count
        )));
    }
    Ok((descriptor, backend))
}
