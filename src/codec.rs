//! Wire codec: serializes and deserializes LPX frames and movement
//! commands for both the TCP wire protocol and the `.lpx` file format,
//! which share exactly the same frame encoding.
//!
//! # Frame framing (server -> client, and file format)
//!
//! 1. `i32` `total_size` (little-endian) = `header_size (32) + data_size`.
//! 2. Header: eight little-endian `i32`s —
//!    `[length, max_cells, spiral_period_int, width, height,
//!      x_offset_fixed, y_offset_fixed, reserved]`. Offsets are
//!    multiplied by 10^5 and rounded to the nearest `i32`.
//! 3. Body: `length` packed B-G-R-0 cells, each a little-endian `u32`.
//!
//! Frames are sent back-to-back with no command-type prefix.
//!
//! # Movement command framing (client -> server)
//!
//! `u32` `cmd_type` (`1` = `CMD_MOVEMENT`; `0` is reserved for "no
//! command"), followed by three little-endian `f32`s: `delta_x,
//! delta_y, step_size`.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{AppResult, LpxError};
use crate::frame::LpxFrame;

/// Size in bytes of a frame's fixed header (eight `i32`s).
pub const HEADER_SIZE: usize = 32;

/// Scale applied to `x_offset`/`y_offset` before truncating to `i32` for
/// the wire (and back after decoding).
const OFFSET_FIXED_POINT_SCALE: f64 = 100_000.0;

/// Reserved "no command pending" marker on the client -> server channel.
pub const CMD_NONE: u32 = 0;
/// Movement-command marker on the client -> server channel.
pub const CMD_MOVEMENT: u32 = 1;

/// A `(delta_x, delta_y, step_size)` triple received from a client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementCommand {
    pub delta_x: f32,
    pub delta_y: f32,
    pub step_size: f32,
}

/// Encode a frame into its wire/file representation, including the
/// leading `total_size` prefix.
#[must_use]
pub fn encode_frame(frame: &LpxFrame) -> Vec<u8> {
    let data_size = frame.length * 4;
    let total_size = HEADER_SIZE + data_size;

    let mut buf = Vec::with_capacity(4 + total_size);
    buf.write_i32::<LittleEndian>(total_size as i32)
        .expect("writing to a Vec cannot fail");

    let x_offset_fixed = (frame.x_offset * OFFSET_FIXED_POINT_SCALE).round() as i32;
    let y_offset_fixed = (frame.y_offset * OFFSET_FIXED_POINT_SCALE).round() as i32;
    let spiral_period_int = frame.spiral_period.trunc() as i32;

    const INFALLIBLE: &str = "writing to a Vec cannot fail";

    buf.write_i32::<LittleEndian>(frame.length as i32)
        .expect(INFALLIBLE);
    buf.write_i32::<LittleEndian>(frame.cells.len() as i32)
        .expect(INFALLIBLE);
    buf.write_i32::<LittleEndian>(spiral_period_int)
        .expect(INFALLIBLE);
    buf.write_i32::<LittleEndian>(frame.source_width as i32)
        .expect(INFALLIBLE);
    buf.write_i32::<LittleEndian>(frame.source_height as i32)
        .expect(INFALLIBLE);
    buf.write_i32::<LittleEndian>(x_offset_fixed).expect(INFALLIBLE);
    buf.write_i32::<LittleEndian>(y_offset_fixed).expect(INFALLIBLE);
    buf.write_i32::<LittleEndian>(0).expect(INFALLIBLE); // reserved

    for &cell in &frame.cells[..frame.length] {
        buf.write_u32::<LittleEndian>(cell).expect(INFALLIBLE);
    }

    buf
}

/// Write an encoded frame to any `Write` sink (TCP stream or file).
///
/// # Errors
///
/// Returns `LpxError::Io` on a write failure.
pub fn write_frame<W: Write>(w: &mut W, frame: &LpxFrame) -> AppResult<()> {
    w.write_all(&encode_frame(frame))?;
    Ok(())
}

/// Read a full frame (length prefix, header, body) from any `Read`
/// source (TCP stream or file).
///
/// # Errors
///
/// Returns `LpxError::Io` on a read failure, or `LpxError::Protocol` if
/// the declared `total_size` is smaller than the fixed header.
pub fn read_frame<R: Read>(r: &mut R) -> AppResult<LpxFrame> {
    let total_size = r.read_i32::<LittleEndian>()?;
    if total_size < HEADER_SIZE as i32 {
        return Err(LpxError::Protocol(format!(
            "frame total_size {total_size} smaller than header size {HEADER_SIZE}"
        )));
    }

    let length = r.read_i32::<LittleEndian>()?;
    let _max_cells = r.read_i32::<LittleEndian>()?;
    let spiral_period_int = r.read_i32::<LittleEndian>()?;
    let width = r.read_i32::<LittleEndian>()?;
    let height = r.read_i32::<LittleEndian>()?;
    let x_offset_fixed = r.read_i32::<LittleEndian>()?;
    let y_offset_fixed = r.read_i32::<LittleEndian>()?;
    let _reserved = r.read_i32::<LittleEndian>()?;

    if length < 0 {
        return Err(LpxError::Protocol(format!(
            "frame declares negative length {length}"
        )));
    }
    let length = length as usize;

    let declared_body = total_size as usize - HEADER_SIZE;
    if declared_body != length * 4 {
        return Err(LpxError::Protocol(format!(
            "frame body size {declared_body} does not match length {length} * 4"
        )));
    }

    let mut cells = Vec::with_capacity(length);
    for _ in 0..length {
        cells.push(r.read_u32::<LittleEndian>()?);
    }

    Ok(LpxFrame {
        cells,
        length,
        spiral_period: f64::from(spiral_period_int) + 0.5,
        source_width: width as u32,
        source_height: height as u32,
        x_offset: f64::from(x_offset_fixed) / OFFSET_FIXED_POINT_SCALE,
        y_offset: f64::from(y_offset_fixed) / OFFSET_FIXED_POINT_SCALE,
    })
}

/// Encode a movement command, including its `cmd_type` prefix.
#[must_use]
pub fn encode_movement_command(cmd: &MovementCommand) -> Vec<u8> {
    const INFALLIBLE: &str = "writing to a Vec cannot fail";

    let mut buf = Vec::with_capacity(16);
    buf.write_u32::<LittleEndian>(CMD_MOVEMENT).expect(INFALLIBLE);
    buf.write_f32::<LittleEndian>(cmd.delta_x).expect(INFALLIBLE);
    buf.write_f32::<LittleEndian>(cmd.delta_y).expect(INFALLIBLE);
    buf.write_f32::<LittleEndian>(cmd.step_size).expect(INFALLIBLE);
    buf
}

/// Write a movement command to a sink.
///
/// # Errors
///
/// Returns `LpxError::Io` on a write failure.
pub fn write_movement_command<W: Write>(w: &mut W, cmd: &MovementCommand) -> AppResult<()> {
    w.write_all(&encode_movement_command(cmd))?;
    Ok(())
}

/// Decode a movement command from exactly 16 bytes: a `cmd_type`
/// prefix followed by three `f32`s.
///
/// # Errors
///
/// Returns `LpxError::Protocol` if `cmd_type` is not `CMD_MOVEMENT`.
pub fn decode_movement_command(bytes: &[u8; 16]) -> AppResult<MovementCommand> {
    let mut r = &bytes[..];
    let cmd_type = r.read_u32::<LittleEndian>()?;
    if cmd_type != CMD_MOVEMENT {
        return Err(LpxError::Protocol(format!(
            "unrecognized command type {cmd_type}"
        )));
    }
    Ok(MovementCommand {
        delta_x: r.read_f32::<LittleEndian>()?,
        delta_y: r.read_f32::<LittleEndian>()?,
        step_size: r.read_f32::<LittleEndian>()?,
    })
}
