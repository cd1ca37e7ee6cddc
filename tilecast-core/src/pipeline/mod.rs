//! # The per-device streaming pipeline
//!
//! ```text
//! BROWSER (headless)                          DISPLAY CLIENT
//! ┌──────────────────────────┐                ┌─────────────────────┐
//! │ screencast / screenshot  │                │ tile blitter        │
//! └───────────┬──────────────┘                └──────────▲──────────┘
//!             │ PNG (CDP events)                         │ packets (WebSocket)
//! ┌───────────▼──────────────┐                ┌──────────┴──────────┐
//! │ DeviceSession event loop │                │ Broadcaster drain   │
//! │   pending slot           │                │   stale-frame drop  │
//! │   throttle / fallback    │   FrameOut     │   mid-frame abort   │
//! │   hash gate → decode     │ ─────────────► │   pacing gate       │
//! │   rotate → FrameProcessor│                │                     │
//! └──────────────────────────┘                └─────────────────────┘
//! ```
//!
//! | Module       | Purpose                                            |
//! |--------------|----------------------------------------------------|
//! | `raster`     | PNG decode, rotation, JPEG encode (codec adapter)  |
//! | `processor`  | Tile-level diffing and full-frame forcing          |
//! | `broadcast`  | Per-device client fan-out, pacing, stale dropping  |
//! | `session`    | Per-device event loop owning target and timers     |
//! | `registry`   | Device map: ensure / rebuild / idle eviction       |

pub mod broadcast;
pub mod processor;
pub mod raster;
pub mod registry;
pub mod session;

// ── Re-exports ───────────────────────────────────────────────────

pub use broadcast::{Broadcaster, ClientLink, LinkBackend, LinkMessage, OutFrame};
pub use processor::{FrameEncoding, FrameOut, FrameProcessor, TileRect};
pub use raster::Raster;
pub use registry::{DeviceRegistry, IDLE_TTL};
pub use session::{DeviceSession, SessionEvent};
