//! Domain-specific error types for the tilecast pipeline.
//!
//! All fallible operations return `Result<T, CastError>`.
//! No panics on invalid input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the tilecast core.
#[derive(Debug, Error)]
pub enum CastError {
    // ── Browser Errors ───────────────────────────────────────────
    /// The DevTools endpoint could not be reached or attached.
    #[error("browser endpoint not ready: {0}")]
    BrowserNotReady(String),

    /// A DevTools command returned an error or could not be delivered.
    #[error("browser command {method} failed: {reason}")]
    CommandFailed { method: String, reason: String },

    // ── Codec Errors ─────────────────────────────────────────────
    /// An encoded frame could not be decoded to a raster.
    #[error("frame decode failed: {0}")]
    DecodeFailed(String),

    /// A raster region could not be JPEG-encoded.
    #[error("tile encode failed: {0}")]
    EncodeFailed(String),

    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not form a valid tilecast packet.
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for CastError {
    fn from(s: String) -> Self {
        CastError::Other(s)
    }
}

impl From<&str> for CastError {
    fn from(s: &str) -> Self {
        CastError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CastError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CastError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = CastError::CommandFailed {
            method: "Page.enable".into(),
            reason: "no session".into(),
        };
        assert!(e.to_string().contains("Page.enable"));
        assert!(e.to_string().contains("no session"));

        let e = CastError::InvalidPacket("short header");
        assert!(e.to_string().contains("short header"));
    }

    #[test]
    fn from_string() {
        let e: CastError = "something broke".into();
        assert!(matches!(e, CastError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: CastError = io_err.into();
        assert!(matches!(e, CastError::Connection(_)));
    }
}
