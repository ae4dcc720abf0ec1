//! `lpxcast`: converts rectangular video frames into a log-polar
//! hexagonal-cell (LPX) representation and broadcasts the resulting
//! cell arrays to networked clients in real time.
//!
//! # Module map
//!
//! - [`tables`] — immutable scan tables (pixel index -> cell index).
//! - [`image`] — minimal decoded-image representation.
//! - [`frame`] — the LPX frame: packed-color cell array plus header.
//! - [`scan`] — the scan engine: `(image, cx, cy, tables) -> LpxFrame`.
//! - [`source`] — frame sources (real video file, synthetic generator).
//! - [`codec`] — wire/file serialization for frames and movement commands.
//! - [`server`] — the TCP broadcast server and its lifecycle.
//! - [`config`] — `ServerConfig` loading and validation.
//! - [`error`] — crate-wide error taxonomy.

pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod image;
pub mod scan;
pub mod server;
pub mod source;
pub mod tables;
