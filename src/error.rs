//! Crate-wide error types.
//!
//! This module defines the primary error type, `LpxError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of every subsystem, from
//! configuration and scan-table loading to per-client socket I/O.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from the `figment` crate, typically related to
//!   file parsing or format issues in the configuration file.
//! - **`Configuration`**: Semantic errors in configuration that pass parsing
//!   but are logically invalid (zero port, zero output dimensions, ...).
//! - **`Io`**: Wraps `std::io::Error`, covering file and network I/O.
//! - **`InvalidScanTables`**: The scan-tables file failed a structural or
//!   range check (see `tables::load`).
//! - **`VideoOpen` / `VideoRead`**: The video decoder refused to open a file,
//!   or a mid-stream read failed.
//! - **`Scan`**: A single scan could not be produced (empty image, unsupported
//!   channel count). Callers drop the frame and continue.
//! - **`ClientIo`**: Send/receive failure on a client socket. The offending
//!   client is evicted; others are unaffected.
//! - **`Protocol`**: An unrecognized command type or a short read of a
//!   command. Treated identically to `ClientIo`.
//!
//! By using `#[from]`, `LpxError` can be constructed from underlying error
//! types with `?`, matching the rest of the crate's error-propagation style.

use thiserror::Error;

/// Convenience alias for results using the crate's error type.
pub type AppResult<T> = std::result::Result<T, LpxError>;

#[derive(Error, Debug)]
pub enum LpxError {
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid scan tables: {0}")]
    InvalidScanTables(String),

    #[error("could not open video file {path}: {source}")]
    VideoOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("video read error: {0}")]
    VideoRead(String),

    #[error("scan error: {0}")]
    Scan(String),

    #[error("client I/O error: {0}")]
    ClientIo(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LpxError::Scan("empty image".to_string());
        assert_eq!(err.to_string(), "scan error: empty image");
    }

    #[test]
    fn test_invalid_scan_tables_display() {
        let err = LpxError::InvalidScanTables("outer_pixel_index not sorted".to_string());
        assert!(err.to_string().contains("not sorted"));
    }
}
