//! Typed failures for the bus, storage and reference-data boundaries.
//!
//! Application-level plumbing (startup, config) uses `anyhow`; these enums are
//! for the places where the caller branches on what went wrong.

use thiserror::Error;

/// failure of a single bus operation. never fatal past the bus client.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    #[error("bus not connected")]
    NotConnected,

    #[error("bus operation timed out")]
    Timeout,

    #[error("bus i/o error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device returned exception: {0}")]
    Exception(String),

    #[error("short response: expected {expected} registers, got {got}")]
    ShortResponse { expected: u16, got: usize },

    #[error("invalid bus settings: {0}")]
    Config(String),
}

impl BusError {
    /// true when the link must be reopened before the next read.
    /// after a timeout or a framing error a late reply may still be in flight
    /// and would be taken as the next unit's response. a device exception is
    /// a complete reply and leaves the stream in step.
    pub fn invalidates_link(&self) -> bool {
        matches!(
            self,
            BusError::Io(_) | BusError::NotConnected | BusError::Timeout | BusError::Protocol(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl StorageError {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            StorageError::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            StorageError::Csv(e) => match e.kind() {
                csv::ErrorKind::Io(io) => io.kind() == std::io::ErrorKind::PermissionDenied,
                _ => false,
            },
        }
    }
}

/// reference tables (air quality, sun almanac) are optional inputs.
/// every variant here is recoverable.
#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("reference file not found: {0}")]
    Missing(String),

    #[error("reference file has no usable rows: {0}")]
    Empty(String),

    #[error("reference file unreadable: {0}")]
    Malformed(#[from] csv::Error),

    #[error("reference file i/o error: {0}")]
    Io(#[from] std::io::Error),
}
