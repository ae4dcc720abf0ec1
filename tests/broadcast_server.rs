//! Integration tests driving a real, running `BroadcastServer` over a
//! loopback TCP connection: client connect/restart semantics (S4),
//! movement application across multiple clients (S6), and clean
//! shutdown (P6).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};

use lpxcast::codec::{self, MovementCommand};
use lpxcast::config::ServerConfig;
use lpxcast::scan::ScanEngine;
use lpxcast::server::BroadcastServer;
use lpxcast::source::SyntheticFrameSource;
use lpxcast::tables::ScanTables;

/// Build a minimal, valid scan-tables file: a handful of directly
/// addressed fovea cells plus a few peripheral cells each covering one
/// row of the scan map, and write it to a fresh temp file.
fn write_test_tables(map_width: i32, fovea_cells: i32, peripheral_cells: i32) -> tempfile::NamedTempFile {
    let last_fovea_index = fovea_cells - 1;
    let last_cell_index = fovea_cells + peripheral_cells - 1;

    let inner_cells: Vec<(i32, i32)> = (0..fovea_cells)
        .map(|i| (map_width / 2 + i - fovea_cells / 2, map_width / 2))
        .collect();

    let mut outer_pixel_index = Vec::new();
    let mut outer_pixel_cell_idx = Vec::new();
    let mut next_pixel = map_width;
    for c in 0..peripheral_cells {
        outer_pixel_index.push(next_pixel);
        outer_pixel_cell_idx.push(fovea_cells + c);
        next_pixel += map_width;
    }

    let outer_length = outer_pixel_index.len() as i32;
    let inner_length = inner_cells.len() as i32;
    let total_ints = 7 + 2 * outer_length + 2 * inner_length;

    let mut buf = Vec::new();
    buf.write_i32::<LittleEndian>(total_ints).unwrap();
    buf.write_i32::<LittleEndian>(map_width).unwrap();
    buf.write_i32::<LittleEndian>(63).unwrap(); // -> spiral_period 63.5
    buf.write_i32::<LittleEndian>(outer_length).unwrap();
    buf.write_i32::<LittleEndian>(inner_length).unwrap();
    buf.write_i32::<LittleEndian>(last_fovea_index).unwrap();
    buf.write_i32::<LittleEndian>(last_cell_index).unwrap();
    for p in &outer_pixel_index {
        buf.write_i32::<LittleEndian>(*p).unwrap();
    }
    for c in &outer_pixel_cell_idx {
        buf.write_i32::<LittleEndian>(*c).unwrap();
    }
    for (x, y) in &inner_cells {
        buf.write_i32::<LittleEndian>(*x).unwrap();
        buf.write_i32::<LittleEndian>(*y).unwrap();
    }

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&buf).unwrap();
    file
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn start_test_server(port: u16, loop_video: bool) -> (BroadcastServer, tempfile::NamedTempFile) {
    let tables_file = write_test_tables(2000, 5, 20);
    let tables = Arc::new(ScanTables::load(tables_file.path()).unwrap());
    let scan_engine = Arc::new(ScanEngine::new(tables.clone()).unwrap());

    let config = ServerConfig {
        scan_tables_path: tables_file.path().to_path_buf(),
        video_file_path: "unused.mp4".into(),
        port,
        output_width: 64,
        output_height: 64,
        target_fps: 60.0,
        loop_video,
        log_level: "error".into(),
    };

    let source: Box<dyn lpxcast::source::FrameSource> =
        Box::new(SyntheticFrameSource::new(64, 64, 60.0, 5));

    let server = BroadcastServer::start(&config, tables, scan_engine, source).unwrap();
    (server, tables_file)
}

fn read_one_frame(stream: &mut TcpStream) -> lpxcast::frame::LpxFrame {
    codec::read_frame(stream).expect("reading a frame from the server")
}

#[test]
fn first_client_receives_frame_zero_after_restart() {
    let port = free_port();
    let (server, _tables_file) = start_test_server(port, true);

    // Give the video loop a moment to idle with no clients connected.
    std::thread::sleep(Duration::from_millis(50));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let frame = read_one_frame(&mut stream);
    // SyntheticFrameSource's frame 0 is solid color (0, 0, 0), so every
    // cell the scan touches should pack to zero.
    assert!(frame.cells.iter().take(frame.length).all(|&c| c == 0));
    assert!((frame.x_offset - 32.0).abs() < 1e-6);
    assert!((frame.y_offset - 32.0).abs() < 1e-6);

    server.stop();
}

#[test]
fn movement_command_is_applied_and_clamped() {
    let port = free_port();
    let (server, _tables_file) = start_test_server(port, true);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // Drain the first frame so the server has registered this client.
    let _ = read_one_frame(&mut stream);

    let cmd = MovementCommand {
        delta_x: 10.0,
        delta_y: 0.0,
        step_size: 1_000_000.0,
    };
    codec::write_movement_command(&mut stream, &cmd).unwrap();

    // Give the broadcast thread a couple of frame periods to observe
    // and apply the command.
    std::thread::sleep(Duration::from_millis(200));

    let (x, _y) = server.center_offsets();
    assert!((x - 400.0).abs() < 1e-6, "expected clamp to 0.2*2000=400, got {x}");

    server.stop();
}

#[test]
fn two_clients_both_observe_one_clients_movement() {
    let port = free_port();
    let (server, _tables_file) = start_test_server(port, true);

    let mut a = TcpStream::connect(("127.0.0.1", port)).expect("connect a");
    a.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let _ = read_one_frame(&mut a);

    let mut b = TcpStream::connect(("127.0.0.1", port)).expect("connect b");
    b.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let _ = read_one_frame(&mut b);

    let cmd = MovementCommand {
        delta_x: 1.0,
        delta_y: 0.0,
        step_size: 5.0,
    };
    codec::write_movement_command(&mut a, &cmd).unwrap();

    std::thread::sleep(Duration::from_millis(200));

    let (x, _y) = server.center_offsets();
    assert!((x - 5.0).abs() < 1e-6);

    // Both clients keep receiving frames after the move.
    let _ = read_one_frame(&mut a);
    let _ = read_one_frame(&mut b);

    server.stop();
}

#[test]
fn stop_closes_client_sockets_and_joins_threads() {
    let port = free_port();
    let (server, _tables_file) = start_test_server(port, true);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let _ = read_one_frame(&mut stream);

    server.stop();

    // The socket should now observe EOF or an error rather than hang.
    let mut buf = [0u8; 4];
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let result = stream.read(&mut buf);
    match result {
        Ok(0) => {}      // clean EOF
        Ok(_) => panic!("expected no further data after stop()"),
        Err(_) => {}     // connection reset is also an acceptable outcome
    }
}
