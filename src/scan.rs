//! The scan engine: turns `(image, cx, cy)` plus a shared `ScanTables`
//! into a populated `LpxFrame`.
//!
//! Two phases run in order for every scan: a single-threaded fovea fill
//! (direct pixel sampling, no averaging), then a multi-threaded
//! peripheral accumulation (disjoint row stripes, integer-mean finalize).
//! Output is deterministic regardless of worker count: stripe boundaries
//! are a pure function of the row range and worker count, and every
//! pixel belongs to exactly one stripe.

use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::error::{AppResult, LpxError};
use crate::frame::{pack_bgr, LpxFrame};
use crate::image::Image;
use crate::tables::ScanTables;

/// Maximum number of peripheral-accumulation workers. The scan engine's
/// thread pool and its per-worker scratch buffers are sized to this
/// bound once, at construction, and reused by every subsequent scan —
/// see the "persistent worker pool" design note.
const MAX_WORKERS: usize = 4;

/// Per-worker scratch accumulators, reused across scans to avoid
/// allocator thrash (one `Vec` allocation per worker for the lifetime of
/// the engine, not one per scan).
struct Scratch {
    acc_r: Vec<u32>,
    acc_g: Vec<u32>,
    acc_b: Vec<u32>,
    count: Vec<u32>,
}

impl Scratch {
    fn zeroed(total_cells: usize) -> Self {
        Self {
            acc_r: vec![0; total_cells],
            acc_g: vec![0; total_cells],
            acc_b: vec![0; total_cells],
            count: vec![0; total_cells],
        }
    }

    fn reset(&mut self) {
        self.acc_r.iter_mut().for_each(|v| *v = 0);
        self.acc_g.iter_mut().for_each(|v| *v = 0);
        self.acc_b.iter_mut().for_each(|v| *v = 0);
        self.count.iter_mut().for_each(|v| *v = 0);
    }
}

/// The engine's shared, scan-lifetime accumulators. Reset to zero at the
/// start of every scan, then merged into by each peripheral worker under
/// a single lock per stripe.
struct SharedAccumulators {
    acc_r: Vec<u32>,
    acc_g: Vec<u32>,
    acc_b: Vec<u32>,
    count: Vec<u32>,
}

impl SharedAccumulators {
    fn zeroed(total_cells: usize) -> Self {
        Self {
            acc_r: vec![0; total_cells],
            acc_g: vec![0; total_cells],
            acc_b: vec![0; total_cells],
            count: vec![0; total_cells],
        }
    }

    fn reset(&mut self) {
        self.acc_r.iter_mut().for_each(|v| *v = 0);
        self.acc_g.iter_mut().for_each(|v| *v = 0);
        self.acc_b.iter_mut().for_each(|v| *v = 0);
        self.count.iter_mut().for_each(|v| *v = 0);
    }

    fn merge_from(&mut self, scratch: &Scratch) {
        for i in 0..self.count.len() {
            let c = scratch.count[i];
            if c == 0 {
                continue;
            }
            self.acc_r[i] += scratch.acc_r[i];
            self.acc_g[i] += scratch.acc_g[i];
            self.acc_b[i] += scratch.acc_b[i];
            self.count[i] += c;
        }
    }
}

/// Computes the scan bounding-box radius for a table with `total_cells`
/// cells at the given `spiral_period`, per the log-spiral growth formula
/// in the design notes.
///
/// The documented formula (`spiral_period / (pi/3) * exp((total_cells -
/// 1) / (spiral_period/(pi/3)))`) is degenerate for realistic cell
/// counts — it overflows `f64` well before `total_cells` reaches the
/// thousands, because the original project's spiral-growth constant
/// wasn't preserved through distillation (see `DESIGN.md`, Open
/// Question: spiral radius). Since the scan map is sized to contain the
/// source image at any center (the scan-map/image-size invariant in the
/// glossary) and the bounding box is always clipped to the image
/// afterward, clamping the radius to `map_width` is always safe: it can
/// only make the box larger than strictly necessary, never smaller, so
/// every pixel the tight formula would have scanned is still scanned.
fn spiral_radius(total_cells: usize, spiral_period: f64, map_width: i32) -> f64 {
    let k = spiral_period / (std::f64::consts::PI / 3.0);
    let exponent = ((total_cells.saturating_sub(1)) as f64 / k).min(700.0);
    let r = k * exponent.exp();
    if r.is_finite() {
        r.min(f64::from(map_width))
    } else {
        f64::from(map_width)
    }
}

/// Transforms `(image, cx, cy)` into a populated `LpxFrame` using a
/// shared, immutable `ScanTables`.
pub struct ScanEngine {
    tables: Arc<ScanTables>,
    pool: rayon::ThreadPool,
    scratch: Vec<Mutex<Scratch>>,
    shared: Mutex<SharedAccumulators>,
}

impl ScanEngine {
    /// Build an engine around the given tables, sizing its persistent
    /// worker pool to `min(MAX_WORKERS, hardware_concurrency())`.
    ///
    /// # Errors
    ///
    /// Returns `LpxError::Scan` if the thread pool cannot be built.
    pub fn new(tables: Arc<ScanTables>) -> AppResult<Self> {
        let workers = available_parallelism().min(MAX_WORKERS);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| LpxError::Scan(format!("failed to build worker pool: {e}")))?;

        let total_cells = tables.total_cells();
        let scratch = (0..workers)
            .map(|_| Mutex::new(Scratch::zeroed(total_cells)))
            .collect();

        Ok(Self {
            tables,
            pool,
            scratch,
            shared: Mutex::new(SharedAccumulators::zeroed(total_cells)),
        })
    }

    /// Run a scan: fovea fill, then peripheral accumulate, then finalize.
    ///
    /// # Errors
    ///
    /// Returns `LpxError::Scan` for an empty image. Output is left
    /// unmutated on error.
    pub fn scan(&self, image: &Image, cx: f64, cy: f64) -> AppResult<LpxFrame> {
        if image.is_empty() {
            return Err(LpxError::Scan("source image is empty".into()));
        }

        let tables = &self.tables;
        let total_cells = tables.total_cells();
        let map_width = tables.map_width();
        let half = map_width / 2;
        let last_fovea_index = tables.last_fovea_index();

        let mut cells = vec![0u32; total_cells];

        // Phase A: fovea fill (serial, direct overwrite, no averaging).
        for (i, inner) in tables.inner_cells().iter().enumerate() {
            let img_x = cx + f64::from(inner.x) - f64::from(half);
            let img_y = cy + f64::from(inner.y) - f64::from(half);

            let Some((b, g, r)) = image.sample_bgr(img_x.floor() as i64, img_y.floor() as i64)
            else {
                continue;
            };

            let target = if i <= last_fovea_index {
                Some(i)
            } else {
                tables.outer_cell_at(i)
            };
            if let Some(target) = target {
                cells[target] = pack_bgr(b, g, r);
            }
        }

        // Phase B: peripheral accumulate (parallel, disjoint row stripes).
        {
            let mut shared = self.shared.lock();
            shared.reset();
        }

        let width = i64::from(image.width());
        let height = i64::from(image.height());
        let radius = spiral_radius(total_cells, tables.spiral_period(), map_width);

        let x_min = (cx - radius).floor().max(0.0) as i64;
        let x_max = ((cx + radius).ceil() as i64).min(width);
        let y_min = (cy - radius).floor().max(0.0) as i64;
        let y_max = ((cy + radius).ceil() as i64).min(height);

        if x_min < x_max && y_min < y_max {
            let base = (i64::from(half) - cx.floor() as i64)
                + i64::from(map_width) * (i64::from(half) - cy.floor() as i64);
            let map_area = i64::from(map_width) * i64::from(map_width);

            let stripe_count = {
                let candidate = available_parallelism().min(MAX_WORKERS).min(self.scratch.len());
                let candidate = candidate.max(1);
                if (y_max - y_min) >= 10 * candidate as i64 {
                    candidate
                } else {
                    1
                }
            };

            let stripes = split_rows(y_min, y_max, stripe_count);

            self.pool.install(|| {
                stripes.par_iter().enumerate().for_each(|(s, &(y0, y1))| {
                    let mut scratch = self.scratch[s].lock();
                    scratch.reset();

                    for k in y0..y1 {
                        for j in x_min..x_max {
                            let p = base + i64::from(map_width) * k + j;
                            if p < 0 || p >= map_area {
                                continue;
                            }
                            let target = tables.cell_of(p);
                            if target <= last_fovea_index {
                                continue;
                            }
                            let (b, g, r) = image.raw_bgr(j as u32, k as u32);
                            scratch.acc_r[target] += u32::from(r);
                            scratch.acc_g[target] += u32::from(g);
                            scratch.acc_b[target] += u32::from(b);
                            scratch.count[target] += 1;
                        }
                    }

                    self.shared.lock().merge_from(&scratch);
                });
            });
        }

        // Phase C: finalize.
        {
            let shared = self.shared.lock();
            for i in 0..total_cells {
                if shared.count[i] > 0 {
                    let r = (shared.acc_r[i] / shared.count[i]) as u8;
                    let g = (shared.acc_g[i] / shared.count[i]) as u8;
                    let b = (shared.acc_b[i] / shared.count[i]) as u8;
                    cells[i] = pack_bgr(b, g, r);
                } else if i > last_fovea_index {
                    cells[i] = 0;
                }
                // else: i <= last_fovea_index and uncontributed — leave
                // whatever Phase A wrote (possibly still zero).
            }
        }

        Ok(LpxFrame {
            cells,
            length: total_cells,
            spiral_period: tables.spiral_period(),
            source_width: image.width(),
            source_height: image.height(),
            x_offset: cx,
            y_offset: cy,
        })
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Split `[y_min, y_max)` into `n` contiguous, nonoverlapping row
/// stripes of near-equal size (the last stripe absorbs the remainder).
fn split_rows(y_min: i64, y_max: i64, n: usize) -> Vec<(i64, i64)> {
    let total = y_max - y_min;
    let n = n as i64;
    let base = total / n;
    let remainder = total % n;

    let mut stripes = Vec::with_capacity(n as usize);
    let mut start = y_min;
    for i in 0..n {
        let size = base + i64::from(i < remainder);
        let end = start + size;
        if start < end {
            stripes.push((start, end));
        }
        start = end;
    }
    stripes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Channels;
    use crate::tables::test_support::{make_tables_bytes, write_tables_file};

    fn solid_image(width: u32, height: u32, b: u8, g: u8, r: u8) -> Image {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            data.push(b);
            data.push(g);
            data.push(r);
        }
        Image::new(width, height, Channels::Bgr, data)
    }

    fn engine_with_tables(map_width: i32, spiral_period_int: i32, fovea: i32, peripheral: i32) -> (ScanEngine, Arc<ScanTables>) {
        let bytes = make_tables_bytes(map_width, spiral_period_int, fovea, peripheral);
        let file = write_tables_file(&bytes);
        let tables = Arc::new(ScanTables::load(file.path()).unwrap());
        let engine = ScanEngine::new(tables.clone()).unwrap();
        (engine, tables)
    }

    #[test]
    fn solid_color_scan_is_uniform_everywhere_contributed() {
        let (engine, tables) = engine_with_tables(64, 63, 5, 4);
        let image = solid_image(64, 64, 30, 20, 10);

        let frame = engine.scan(&image, 32.0, 32.0).unwrap();

        assert_eq!(frame.length, tables.total_cells());
        let expected = pack_bgr(30, 20, 10);
        let nonzero: Vec<_> = frame.cells.iter().filter(|&&c| c != 0).collect();
        assert!(!nonzero.is_empty());
        for &&c in &nonzero {
            assert_eq!(c, expected);
        }
    }

    #[test]
    fn scan_is_deterministic_regardless_of_worker_count() {
        let (engine, _tables) = engine_with_tables(64, 63, 5, 4);
        let image = solid_image(64, 64, 5, 9, 200);

        let a = engine.scan(&image, 32.0, 32.0).unwrap();
        let b = engine.scan(&image, 32.0, 32.0).unwrap();
        assert_eq!(a.cells, b.cells);
    }

    #[test]
    fn empty_image_is_a_scan_error() {
        let (engine, _tables) = engine_with_tables(64, 63, 5, 4);
        let image = Image::new(0, 0, Channels::Bgr, vec![]);
        assert!(matches!(engine.scan(&image, 0.0, 0.0), Err(LpxError::Scan(_))));
    }

    #[test]
    fn split_rows_covers_range_without_overlap() {
        let stripes = split_rows(0, 23, 4);
        let mut covered = 0;
        let mut last_end = 0;
        for (s, e) in stripes {
            assert_eq!(s, last_end);
            covered += e - s;
            last_end = e;
        }
        assert_eq!(covered, 23);
    }
}
