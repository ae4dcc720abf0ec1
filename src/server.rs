//! Broadcast server: TCP listener, per-client send queue, movement
//! command intake, and lifecycle. Owns three long-lived threads —
//! accept, video, broadcast — plus the scan engine's own persistent
//! worker pool used within a single scan's peripheral phase.
//!
//! The outbound queue between the video thread and the broadcast
//! thread is bounded (capacity 3) and lossy: a full queue evicts its
//! oldest frame rather than blocking the producer, the same
//! never-block-the-writer discipline as the teacher's
//! `data::ring_buffer` tap consumers.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use socket2::Socket;
use tracing::{debug, error, info, warn};

use crate::codec::{self, MovementCommand};
use crate::config::ServerConfig;
use crate::error::{AppResult, LpxError};
use crate::frame::LpxFrame;
use crate::scan::ScanEngine;
use crate::source::FrameSource;
use crate::tables::ScanTables;

const OUTBOUND_QUEUE_CAPACITY: usize = 3;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const CLIENT_SEND_BUFFER_BYTES: usize = 64 * 1024;

/// Bounded, lossy, single-producer multi-consumer-by-draining outbound
/// queue. `push` never blocks: when full, the oldest frame is evicted
/// to make room for the newest (§3, Server State).
struct OutboundQueue {
    capacity: usize,
    inner: Mutex<VecDeque<Arc<LpxFrame>>>,
    not_empty: Condvar,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
        }
    }

    fn push(&self, frame: Arc<LpxFrame>) {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(frame);
        self.not_empty.notify_one();
    }

    /// Block (with a timeout, so `running` can be re-checked) until a
    /// frame is available or the server is stopping.
    fn pop_wait(&self, running: &AtomicBool) -> Option<Arc<LpxFrame>> {
        let mut q = self.inner.lock();
        loop {
            if let Some(frame) = q.pop_front() {
                return Some(frame);
            }
            if !running.load(Ordering::Relaxed) {
                return None;
            }
            self.not_empty.wait_for(&mut q, Duration::from_millis(100));
        }
    }

    fn drain(&self) {
        self.inner.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// A connected client: its socket plus a partial-command scratch
/// buffer, since a non-blocking read can return fewer than the 16
/// bytes a movement command needs.
struct Client {
    id: u64,
    stream: TcpStream,
    cmd_buf: Vec<u8>,
}

impl Client {
    /// Poll for a pending movement command without blocking.
    ///
    /// Returns `Ok(None)` if fewer than 16 bytes are currently
    /// available (the remainder arrives on a later poll).
    ///
    /// # Errors
    ///
    /// Returns `LpxError::ClientIo` if the client disconnected, or
    /// `LpxError::Protocol` if the bytes received don't decode to a
    /// recognized command.
    fn poll_movement(&mut self) -> AppResult<Option<MovementCommand>> {
        let mut scratch = [0u8; 16];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Err(LpxError::ClientIo(format!("client {} closed", self.id))),
                Ok(n) => self.cmd_buf.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(LpxError::ClientIo(e.to_string())),
            }
        }

        if self.cmd_buf.len() < 16 {
            return Ok(None);
        }
        let bytes: [u8; 16] = self.cmd_buf[..16].try_into().expect("length checked above");
        self.cmd_buf.drain(..16);
        codec::decode_movement_command(&bytes).map(Some)
    }

    /// Send a frame, retrying on `WouldBlock` until the whole buffer is
    /// written. This is the spec's documented "blocking send" baseline
    /// (§9: a slow client can stall the broadcast loop); the permitted
    /// refinement (per-client ring buffers, non-blocking eviction) is
    /// not implemented here.
    fn send_frame(&mut self, bytes: &[u8]) -> AppResult<()> {
        let mut written = 0;
        while written < bytes.len() {
            match self.stream.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(LpxError::ClientIo(format!(
                        "client {} closed mid-send",
                        self.id
                    )))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(LpxError::ClientIo(e.to_string())),
            }
        }
        Ok(())
    }
}

/// State shared across the accept, video, and broadcast threads.
struct Shared {
    running: AtomicBool,
    clients: Mutex<Vec<Client>>,
    queue: OutboundQueue,
    loop_video: AtomicBool,
    restart_video: AtomicBool,
    center_x_offset: AtomicU64,
    center_y_offset: AtomicU64,
    tables: Arc<ScanTables>,
    next_client_id: AtomicU64,
    output_width: u32,
    output_height: u32,
}

impl Shared {
    fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    fn center_offsets(&self) -> (f64, f64) {
        (
            f64::from_bits(self.center_x_offset.load(Ordering::Relaxed)),
            f64::from_bits(self.center_y_offset.load(Ordering::Relaxed)),
        )
    }
}

/// Compute the new `(x, y)` center offset after applying a movement
/// command, clamped per §4.5. Pure and side-effect free so it can be
/// unit-tested directly against S3/P8 without a running server.
///
/// Clamp is scan-map-relative (`± 0.2 * map_width`) when `map_width >
/// 0`; otherwise output-size-relative (`± 0.4 * output_{width,height}`).
/// A successfully loaded `ScanTables` always has `map_width > 0`, so the
/// fallback only exercises in isolation (see `DESIGN.md`).
#[must_use]
pub fn apply_movement(
    current: (f64, f64),
    cmd: MovementCommand,
    map_width: i32,
    output_width: u32,
    output_height: u32,
) -> (f64, f64) {
    let x = current.0 + f64::from(cmd.delta_x) * f64::from(cmd.step_size);
    let y = current.1 + f64::from(cmd.delta_y) * f64::from(cmd.step_size);

    let (clamp_x, clamp_y) = if map_width > 0 {
        let bound = 0.2 * f64::from(map_width);
        (bound, bound)
    } else {
        (0.4 * f64::from(output_width), 0.4 * f64::from(output_height))
    };

    (x.clamp(-clamp_x, clamp_x), y.clamp(-clamp_y, clamp_y))
}

fn configure_client_socket(stream: TcpStream) -> std::io::Result<TcpStream> {
    let socket = Socket::from(stream);
    socket.set_nodelay(true)?;
    socket.set_send_buffer_size(CLIENT_SEND_BUFFER_BYTES)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Bind the listener with `SO_REUSEADDR` (§4.4), then put it in
/// non-blocking mode for the accept thread's poll loop. `std::net`
/// offers no way to set `SO_REUSEADDR` before bind, hence `socket2`
/// here too.
fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Type};

    let addr: std::net::SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// The broadcast server's running handle. Build with `start`, tear
/// down with `stop`.
pub struct BroadcastServer {
    shared: Arc<Shared>,
    threads: Mutex<Option<Threads>>,
}

struct Threads {
    accept: JoinHandle<()>,
    video: JoinHandle<()>,
    broadcast: JoinHandle<()>,
}

impl BroadcastServer {
    /// Bind a TCP listener and start the accept, video, and broadcast
    /// threads. `source` drives the video loop; `tables`/`scan_engine`
    /// produce LPX frames from its output.
    ///
    /// # Errors
    ///
    /// Returns `LpxError::ConfigError`-shaped failures (via `Io`) if
    /// the listener cannot be bound.
    pub fn start(
        config: &ServerConfig,
        tables: Arc<ScanTables>,
        scan_engine: Arc<ScanEngine>,
        mut source: Box<dyn FrameSource>,
    ) -> AppResult<Self> {
        let listener = bind_listener(config.port)?;
        info!(port = config.port, "broadcast server listening");

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            clients: Mutex::new(Vec::new()),
            queue: OutboundQueue::new(OUTBOUND_QUEUE_CAPACITY),
            loop_video: AtomicBool::new(config.loop_video),
            restart_video: AtomicBool::new(false),
            center_x_offset: AtomicU64::new(0f64.to_bits()),
            center_y_offset: AtomicU64::new(0f64.to_bits()),
            tables,
            next_client_id: AtomicU64::new(1),
            output_width: config.output_width,
            output_height: config.output_height,
        });

        let target_fps = if config.target_fps > 0.0 {
            config.target_fps
        } else {
            source.frame_rate()
        };
        let target_fps = if target_fps > 0.0 { target_fps } else { 30.0 };

        let accept_shared = shared.clone();
        let accept = std::thread::spawn(move || run_accept_loop(accept_shared, listener));

        let video_shared = shared.clone();
        let video = std::thread::spawn(move || {
            run_video_loop(video_shared, source.as_mut(), &scan_engine, target_fps);
        });

        let broadcast_shared = shared.clone();
        let broadcast = std::thread::spawn(move || run_broadcast_loop(broadcast_shared));

        Ok(Self {
            shared,
            threads: Mutex::new(Some(Threads {
                accept,
                video,
                broadcast,
            })),
        })
    }

    /// Number of currently connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.client_count()
    }

    /// Current optical-center offset, as applied by the broadcast
    /// thread (§4.5).
    #[must_use]
    pub fn center_offsets(&self) -> (f64, f64) {
        self.shared.center_offsets()
    }

    /// Set whether the video loop restarts (rather than stopping) on
    /// end-of-stream. Sampled once per video-loop iteration.
    pub fn set_looping(&self, looping: bool) {
        self.shared.loop_video.store(looping, Ordering::Relaxed);
    }

    /// Stop the server: halt all three threads and close every socket.
    ///
    /// Ordering matters (§4.4): the listener and outbound queue are
    /// unblocked first, broadcast and accept are joined *before* any
    /// client socket is closed (so no thread writes to a closed
    /// socket), and the video thread is joined last.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Relaxed);
        self.shared.queue.not_empty.notify_all();

        let Some(threads) = self.threads.lock().take() else {
            return;
        };

        if let Err(e) = threads.broadcast.join() {
            error!(?e, "broadcast thread panicked");
        }
        if let Err(e) = threads.accept.join() {
            error!(?e, "accept thread panicked");
        }

        for client in self.shared.clients.lock().drain(..) {
            let _ = client.stream.shutdown(std::net::Shutdown::Both);
        }

        if let Err(e) = threads.video.join() {
            error!(?e, "video thread panicked");
        }

        // The video thread may have pushed one more frame after the
        // broadcast thread already drained the queue and returned from
        // `pop_wait`; drain again now that it's joined so P6 ("queue
        // empty after stop") holds with no race.
        self.shared.queue.drain();

        info!("broadcast server stopped");
    }
}

fn run_accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    while shared.running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let stream = match configure_client_socket(stream) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(%addr, error = %e, "failed to configure client socket, dropping");
                        continue;
                    }
                };
                let id = shared.next_client_id.fetch_add(1, Ordering::Relaxed);
                let is_first = {
                    let mut clients = shared.clients.lock();
                    let was_empty = clients.is_empty();
                    clients.push(Client {
                        id,
                        stream,
                        cmd_buf: Vec::with_capacity(16),
                    });
                    was_empty
                };
                info!(%addr, client_id = id, "client connected");
                if is_first {
                    shared.restart_video.store(true, Ordering::Relaxed);
                    shared.queue.drain();
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!(error = %e, "accept() failed");
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn run_video_loop(
    shared: Arc<Shared>,
    source: &mut dyn FrameSource,
    scan_engine: &ScanEngine,
    target_fps: f64,
) {
    let mut last = Instant::now();
    let mut first_frame = true;
    let frame_period = Duration::from_secs_f64(1.0 / target_fps);

    while shared.running.load(Ordering::Relaxed) {
        if shared.restart_video.swap(false, Ordering::AcqRel) {
            if let Err(e) = source.seek_to_start() {
                warn!(error = %e, "seek_to_start failed");
            }
        }

        if shared.client_count() == 0 {
            std::thread::sleep(IDLE_POLL_INTERVAL);
            continue;
        }

        let image = match source.read_frame() {
            Ok(Some(image)) => image,
            Ok(None) => {
                if shared.loop_video.load(Ordering::Relaxed) {
                    if let Err(e) = source.seek_to_start() {
                        warn!(error = %e, "seek_to_start failed after end-of-stream");
                    }
                    continue;
                }
                info!("video source exhausted, stopping video loop");
                break;
            }
            Err(e) => {
                warn!(error = %e, "video read error, stopping video loop");
                break;
            }
        };

        let image = image.resize_nearest(shared.output_width, shared.output_height);

        let (dx, dy) = shared.center_offsets();
        let cx = f64::from(shared.output_width) / 2.0 + dx;
        let cy = f64::from(shared.output_height) / 2.0 + dy;

        match scan_engine.scan(&image, cx, cy) {
            Ok(frame) => {
                debug!(cx, cy, cells = frame.length, "scan produced frame");
                shared.queue.push(Arc::new(frame));
            }
            Err(e) => warn!(error = %e, "scan failed, dropping frame"),
        }

        if !first_frame {
            let elapsed = last.elapsed();
            if elapsed < frame_period {
                std::thread::sleep(frame_period - elapsed);
            }
        }
        // Measured after the sleep: see `DESIGN.md`'s "FPS controller"
        // open-question resolution.
        last = Instant::now();
        first_frame = false;
    }
}

fn run_broadcast_loop(shared: Arc<Shared>) {
    while let Some(frame) = shared.queue.pop_wait(&shared.running) {
        let bytes = codec::encode_frame(&frame);
        let mut dead = Vec::new();

        let mut clients = shared.clients.lock();
        for client in clients.iter_mut() {
            match client.poll_movement() {
                Ok(Some(cmd)) => {
                    let current = shared.center_offsets();
                    let (x, y) = apply_movement(
                        current,
                        cmd,
                        shared.tables.map_width(),
                        shared.output_width,
                        shared.output_height,
                    );
                    shared
                        .center_x_offset
                        .store(x.to_bits(), Ordering::Relaxed);
                    shared
                        .center_y_offset
                        .store(y.to_bits(), Ordering::Relaxed);
                    debug!(client_id = client.id, x, y, "applied movement command");
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(client_id = client.id, error = %e, "movement poll failed");
                    dead.push(client.id);
                    continue;
                }
            }

            if let Err(e) = client.send_frame(&bytes) {
                warn!(client_id = client.id, error = %e, "send failed, evicting client");
                dead.push(client.id);
            }
        }

        if !dead.is_empty() {
            clients.retain(|c| {
                let keep = !dead.contains(&c.id);
                if !keep {
                    let _ = c.stream.shutdown(std::net::Shutdown::Both);
                }
                keep
            });
        }
    }
}
