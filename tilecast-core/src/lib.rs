//! # tilecast-core — remote web-view tile streaming
//!
//! Drives a headless browser to render dashboard pages, captures their
//! pixels, and streams them as compressed rectangular tiles to small
//! embedded display clients. Each display is a logical *device session*
//! whose geometry, tile size, quality and cadence the client chooses at
//! connect time.
//!
//! The hard part lives in [`pipeline`]: reconciling the browser-pushed
//! screencast with a polled screenshot fallback into one serialized
//! stream per device, coalescing newer frames over older ones, and
//! pacing delivery against slow, bufferbloat-prone links without adding
//! latency after quiet periods.

pub mod cdp;
pub mod config;
pub mod error;
pub mod hash;
pub mod pipeline;
pub mod protocol;

pub use cdp::Browser;
pub use config::{DeviceConfig, Rotation};
pub use error::CastError;
pub use pipeline::{Broadcaster, ClientLink, DeviceRegistry};
