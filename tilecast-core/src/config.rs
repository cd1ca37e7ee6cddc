//! Per-device streaming configuration.
//!
//! A display client chooses its geometry, tile size, compression quality
//! and frame cadence at connect time; the resulting [`DeviceConfig`] is
//! immutable for the lifetime of a session. Reconnecting with a different
//! config tears the session down and rebuilds it.

use serde::{Deserialize, Serialize};

// ── Rotation ─────────────────────────────────────────────────────

/// Output rotation applied server-side before diffing.
///
/// Serialised as plain degrees (`0`, `90`, `180`, `270`) so embedded
/// clients can send the value they are physically mounted at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Whether this rotation swaps the output axes.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    /// The rotation in degrees.
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(format!("invalid rotation: {other} (expected 0/90/180/270)")),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(r: Rotation) -> Self {
        r.degrees()
    }
}

// ── DeviceConfig ─────────────────────────────────────────────────

/// Immutable per-session streaming parameters, chosen by the client.
///
/// Two configs are equal iff every field is equal; an unequal config on
/// reconnect forces a session rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    /// Render width in pixels (browser viewport, pre-rotation).
    pub width: u32,
    /// Render height in pixels (browser viewport, pre-rotation).
    pub height: u32,
    /// Diff tile edge length in pixels.
    pub tile_size: u32,
    /// Output rotation.
    pub rotation: Rotation,
    /// JPEG quality, 1–100.
    pub jpeg_quality: u8,
    /// Force a full frame when at least this many tiles changed.
    pub full_frame_tile_count: u32,
    /// Force a full frame when at least this fraction of the area changed (0–1).
    pub full_frame_area_threshold: f32,
    /// Force a full frame every N processed frames regardless of change.
    pub full_frame_every: u32,
    /// Browser-side screencast decimation (capture every Nth compositor frame).
    pub every_nth_frame: u32,
    /// Minimum interval between processed frames, in milliseconds.
    pub min_frame_interval_ms: u64,
    /// Transport MTU: maximum bytes per outgoing message.
    pub max_bytes_per_message: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 480,
            tile_size: 32,
            rotation: Rotation::Deg0,
            jpeg_quality: 80,
            full_frame_tile_count: 64,
            full_frame_area_threshold: 0.5,
            full_frame_every: 300,
            every_nth_frame: 2,
            min_frame_interval_ms: 200,
            max_bytes_per_message: 32 * 1024,
        }
    }
}

impl DeviceConfig {
    /// Output width after rotation.
    pub fn output_width(&self) -> u32 {
        if self.rotation.swaps_axes() {
            self.height
        } else {
            self.width
        }
    }

    /// Output height after rotation.
    pub fn output_height(&self) -> u32 {
        if self.rotation.swaps_axes() {
            self.width
        } else {
            self.height
        }
    }

    /// Clamp out-of-range values to something the pipeline can run with.
    ///
    /// Applied once when a hello is accepted, so stored configs are always
    /// well-formed and config equality compares normalised values.
    pub fn normalized(mut self) -> Self {
        self.width = self.width.clamp(8, 4096);
        self.height = self.height.clamp(8, 4096);
        self.tile_size = self.tile_size.clamp(8, 512);
        self.jpeg_quality = self.jpeg_quality.clamp(1, 100);
        self.full_frame_tile_count = self.full_frame_tile_count.max(1);
        self.full_frame_area_threshold = self.full_frame_area_threshold.clamp(0.0, 1.0);
        self.full_frame_every = self.full_frame_every.max(1);
        self.every_nth_frame = self.every_nth_frame.max(1);
        self.max_bytes_per_message = self.max_bytes_per_message.max(1024);
        self
    }
}

// ── Tests ────────────────────────────────────────────────────────
