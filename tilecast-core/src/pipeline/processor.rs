//! Tile-level frame diffing and encoding.
//!
//! Divides the output image into `tile_size × tile_size` tiles and
//! compares each tile against the previous frame via a per-tile FNV hash.
//! Changed tiles are merged into larger rectangles and JPEG-encoded; when
//! enough of the image changed (or a full frame was requested) the whole
//! image is sent as a single rectangle instead.

use tracing::warn;

use crate::config::DeviceConfig;
use crate::error::CastError;
use crate::hash::{fnv1a32_continue, FNV_OFFSET};
use crate::pipeline::raster::{encode_jpeg_rgb, Raster};

// ── TileRect ─────────────────────────────────────────────────────

/// An encoded rectangle of the output image, tile-aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRect {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub w: u32,
    /// Height in pixels.
    pub h: u32,
    /// Encoded payload bytes.
    pub data: Vec<u8>,
}

// ── FrameEncoding ────────────────────────────────────────────────

/// Payload codec of emitted rectangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEncoding {
    /// JPEG without chroma subsampling.
    Jpeg444,
}

impl FrameEncoding {
    /// Wire discriminant used in packet headers.
    pub fn wire(self) -> u8 {
        match self {
            FrameEncoding::Jpeg444 => 1,
        }
    }
}

// ── FrameOut ─────────────────────────────────────────────────────

/// Result of one processing pass.
///
/// An empty rectangle list means "no change" — the caller must not
/// advance its frame counter or broadcast anything.
#[derive(Debug, Clone)]
pub struct FrameOut {
    /// Changed rectangles in deterministic row-major order.
    pub rects: Vec<TileRect>,
    /// Payload codec.
    pub encoding: FrameEncoding,
    /// Whether `rects` is a single rectangle covering the whole image.
    pub is_full_frame: bool,
}

impl FrameOut {
    fn empty() -> Self {
        Self {
            rects: Vec::new(),
            encoding: FrameEncoding::Jpeg444,
            is_full_frame: false,
        }
    }

    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }
}

// ── FrameProcessor ───────────────────────────────────────────────

/// Stateful tile differ for one device session.
///
/// Remembers a per-tile hash table rather than the previous raster, so
/// memory stays proportional to the tile grid, not the image.
pub struct FrameProcessor {
    tile_size: u32,
    width: u32,
    height: u32,
    quality: u8,
    full_frame_tile_count: u32,
    full_frame_area_threshold: f32,
    full_frame_every: u32,

    tiles_x: u32,
    tiles_y: u32,
    tile_hashes: Vec<u32>,
    frames_processed: u64,
    force_full: bool,
}

/// A merged run of changed tiles, in tile coordinates.
#[derive(Debug, Clone, Copy)]
struct TileRun {
    tx: u32,
    ty: u32,
    tw: u32,
    th: u32,
}

impl FrameProcessor {
    /// Build a processor for one session from its config.
    pub fn new(config: &DeviceConfig) -> Self {
        let width = config.output_width();
        let height = config.output_height();
        let tile_size = config.tile_size.max(1);
        let tiles_x = width.div_ceil(tile_size);
        let tiles_y = height.div_ceil(tile_size);
        Self {
            tile_size,
            width,
            height,
            quality: config.jpeg_quality,
            full_frame_tile_count: config.full_frame_tile_count,
            full_frame_area_threshold: config.full_frame_area_threshold,
            full_frame_every: config.full_frame_every.max(1),
            tiles_x,
            tiles_y,
            tile_hashes: vec![0; (tiles_x * tiles_y) as usize],
            frames_processed: 0,
            force_full: false,
        }
    }

    /// Latch a one-shot full-frame request, consumed by the next
    /// [`process_frame`](Self::process_frame) that emits a full frame.
    pub fn request_full_frame(&mut self) {
        self.force_full = true;
    }

    /// Number of frames this processor has seen.
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Diff one raster against the previous state and encode the result.
    ///
    /// The raster must already be rotated to output orientation. A size
    /// differing from the configured output is tolerated (browsers
    /// occasionally round viewport dimensions); the tile grid is rebuilt
    /// and a full frame emitted.
    pub fn process_frame(&mut self, raster: &Raster) -> Result<FrameOut, CastError> {
        if raster.data.len() != raster.byte_len() {
            return Err(CastError::DecodeFailed(format!(
                "raster size mismatch: {} bytes for {}x{}",
                raster.data.len(),
                raster.width,
                raster.height
            )));
        }

        if raster.width != self.width || raster.height != self.height {
            self.width = raster.width;
            self.height = raster.height;
            self.tiles_x = raster.width.div_ceil(self.tile_size);
            self.tiles_y = raster.height.div_ceil(self.tile_size);
            self.tile_hashes = vec![0; (self.tiles_x * self.tiles_y) as usize];
            self.force_full = true;
        }

        self.frames_processed += 1;

        let current = self.hash_tiles(raster);
        let changed: Vec<usize> = current
            .iter()
            .enumerate()
            .filter(|(i, h)| self.tile_hashes[*i] != **h)
            .map(|(i, _)| i)
            .collect();

        let first_frame = self.frames_processed == 1;
        let cadence_hit = self.frames_processed % u64::from(self.full_frame_every) == 0;
        let count_hit = !changed.is_empty() && changed.len() as u32 >= self.full_frame_tile_count;
        let area_hit = !changed.is_empty()
            && self.changed_area_fraction(&changed) >= self.full_frame_area_threshold;

        if self.force_full || first_frame || cadence_hit || count_hit || area_hit {
            return Ok(self.emit_full_frame(raster, &current));
        }

        if changed.is_empty() {
            return Ok(FrameOut::empty());
        }

        Ok(self.emit_changed_tiles(raster, &current, &changed))
    }

    // ── Internal ─────────────────────────────────────────────────

    /// FNV hash of every tile, row-major.
    fn hash_tiles(&self, raster: &Raster) -> Vec<u32> {
        let ts = self.tile_size as usize;
        let row_stride = raster.width as usize * 4;
        let mut hashes = Vec::with_capacity((self.tiles_x * self.tiles_y) as usize);

        for ty in 0..self.tiles_y as usize {
            let y0 = ty * ts;
            let y1 = (y0 + ts).min(raster.height as usize);
            for tx in 0..self.tiles_x as usize {
                let x0 = tx * ts * 4;
                let x1 = ((tx + 1) * ts * 4).min(row_stride);
                let mut hash = FNV_OFFSET;
                for y in y0..y1 {
                    let row = y * row_stride;
                    hash = fnv1a32_continue(hash, &raster.data[row + x0..row + x1]);
                }
                hashes.push(hash);
            }
        }
        hashes
    }

    /// Fraction of the image area covered by the changed tiles.
    fn changed_area_fraction(&self, changed: &[usize]) -> f32 {
        let total = self.width as u64 * self.height as u64;
        if total == 0 {
            return 0.0;
        }
        let area: u64 = changed
            .iter()
            .map(|&i| {
                let (w, h) = self.tile_pixel_size(i);
                u64::from(w) * u64::from(h)
            })
            .sum();
        (area as f64 / total as f64) as f32
    }

    /// Pixel dimensions of tile `index` (edge tiles may be smaller).
    fn tile_pixel_size(&self, index: usize) -> (u32, u32) {
        let tx = index as u32 % self.tiles_x;
        let ty = index as u32 / self.tiles_x;
        let w = (self.width - tx * self.tile_size).min(self.tile_size);
        let h = (self.height - ty * self.tile_size).min(self.tile_size);
        (w, h)
    }

    /// Encode the whole image as one rectangle.
    ///
    /// On encode failure the result degrades to "no change" and neither
    /// the hash table nor a latched full-frame request is consumed, so
    /// the next frame retries.
    fn emit_full_frame(&mut self, raster: &Raster, current: &[u32]) -> FrameOut {
        let rgb = raster.crop_rgb(0, 0, raster.width, raster.height);
        match encode_jpeg_rgb(&rgb, raster.width, raster.height, self.quality) {
            Ok(data) => {
                self.tile_hashes.copy_from_slice(current);
                self.force_full = false;
                FrameOut {
                    rects: vec![TileRect {
                        x: 0,
                        y: 0,
                        w: raster.width,
                        h: raster.height,
                        data,
                    }],
                    encoding: FrameEncoding::Jpeg444,
                    is_full_frame: true,
                }
            }
            Err(e) => {
                warn!("full-frame encode failed: {e}");
                FrameOut::empty()
            }
        }
    }

    /// Merge and encode the changed tiles.
    ///
    /// A rect that fails to encode is skipped (and its tiles left stale
    /// so they retry next frame); the rest of the frame still goes out.
    fn emit_changed_tiles(&mut self, raster: &Raster, current: &[u32], changed: &[usize]) -> FrameOut {
        let runs = self.merge_tiles(changed);
        let mut rects = Vec::with_capacity(runs.len());

        for run in runs {
            let x = run.tx * self.tile_size;
            let y = run.ty * self.tile_size;
            let w = (run.tw * self.tile_size).min(self.width - x);
            let h = (run.th * self.tile_size).min(self.height - y);

            let rgb = raster.crop_rgb(x, y, w, h);
            match encode_jpeg_rgb(&rgb, w, h, self.quality) {
                Ok(data) => {
                    for ty in run.ty..run.ty + run.th {
                        for tx in run.tx..run.tx + run.tw {
                            let i = (ty * self.tiles_x + tx) as usize;
                            self.tile_hashes[i] = current[i];
                        }
                    }
                    rects.push(TileRect { x, y, w, h, data });
                }
                Err(e) => {
                    warn!("tile encode failed at ({x},{y}) {w}x{h}: {e}");
                }
            }
        }

        FrameOut {
            rects,
            encoding: FrameEncoding::Jpeg444,
            is_full_frame: false,
        }
    }

    /// Merge changed tiles into rectangles: consecutive tiles in a row
    /// first, then vertically when runs in adjacent rows share the same
    /// horizontal span. Output order is row-major by run origin.
    fn merge_tiles(&self, changed: &[usize]) -> Vec<TileRun> {
        let mut flags = vec![false; (self.tiles_x * self.tiles_y) as usize];
        for &i in changed {
            flags[i] = true;
        }

        let mut runs: Vec<TileRun> = Vec::new();
        // Indices into `runs` of the previous row, for vertical merging.
        let mut prev_row: Vec<usize> = Vec::new();

        for ty in 0..self.tiles_y {
            let mut row: Vec<usize> = Vec::new();
            let mut tx = 0;
            while tx < self.tiles_x {
                if !flags[(ty * self.tiles_x + tx) as usize] {
                    tx += 1;
                    continue;
                }
                let start = tx;
                while tx < self.tiles_x && flags[(ty * self.tiles_x + tx) as usize] {
                    tx += 1;
                }
                let tw = tx - start;

                // Extend an aligned run from the previous row if possible.
                let merged = prev_row.iter().copied().find(|&ri| {
                    let r = runs[ri];
                    r.tx == start && r.tw == tw && r.ty + r.th == ty
                });
                match merged {
                    Some(ri) => {
                        runs[ri].th += 1;
                        row.push(ri);
                    }
                    None => {
                        runs.push(TileRun {
                            tx: start,
                            ty,
                            tw,
                            th: 1,
                        });
                        row.push(runs.len() - 1);
                    }
                }
            }
            prev_row = row;
        }
        runs
    }
}

// ── Tests ────────────────────────────────────────────────────────
