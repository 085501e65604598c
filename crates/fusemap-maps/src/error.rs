use thiserror::Error;

use crate::backend::BackendKind;

// ─────────────────────────────────────────────────────────────────────────────
// Error types
// ─────────────────────────────────────────────────────────────────────────────

/// Failures while decoding a persisted backend payload.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Not a map payload (bad magic {0:?})")]
    BadMagic([u8; 4]),
    #[error("Unsupported payload version {0}")]
    UnsupportedVersion(u16),
    #[error("Payload holds a {found} map, expected {expected}")]
    KindMismatch { expected: BackendKind, found: BackendKind },
    #[error("Unknown backend tag {0}")]
    UnknownKind(u8),
    #[error("Payload truncated or unreadable: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the map backends.
#[derive(Error, Debug)]
pub enum MapsError {
    #[error("Invalid backend parameters: {0}")]
    InvalidParams(String),
    #[error("Payload codec error: {0}")]
    Codec(#[from] CodecError),
}
