//! Process-wide device registry.
//!
//! An explicit owner object constructed at startup and threaded through
//! the transport callbacks: it maps client-chosen device identifiers to
//! running [`DeviceSession`]s, rebuilds sessions on config changes, and
//! evicts idle ones. The idle sweep carries its own reentrancy guard so
//! overlapping timer ticks cannot double-destroy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cdp::Browser;
use crate::config::DeviceConfig;
use crate::error::CastError;
use crate::pipeline::broadcast::Broadcaster;
use crate::pipeline::session::{self, now_ms, DeviceSession};

/// Sessions idle longer than this are destroyed by the sweep.
pub const IDLE_TTL: Duration = Duration::from_secs(300);

// ── DeviceRegistry ───────────────────────────────────────────────

/// Owner of every device session in the process.
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceSession>>,
    browser: Arc<Browser>,
    broadcaster: Arc<Broadcaster>,
    reduced_motion: bool,
    cleanup_running: AtomicBool,
}

impl DeviceRegistry {
    /// Build the registry. `reduced_motion` applies
    /// `prefers-reduced-motion: reduce` emulation to every target.
    pub fn new(browser: Arc<Browser>, broadcaster: Arc<Broadcaster>, reduced_motion: bool) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            browser,
            broadcaster,
            reduced_motion,
            cleanup_running: AtomicBool::new(false),
        }
    }

    /// Ensure a session exists for `device_id` with exactly `config`.
    ///
    /// An existing session with an equal config is kept (and a full-frame
    /// request latched for the new viewer); a differing config destroys
    /// and rebuilds the session.
    pub async fn ensure_device(&self, device_id: &str, config: DeviceConfig) -> Result<(), CastError> {
        let mut devices = self.devices.lock().await;

        if let Some(existing) = devices.get(device_id) {
            if existing.config() == &config {
                existing.touch();
                existing.request_full_frame().await;
                return Ok(());
            }
            debug!(device = device_id, "config changed, rebuilding session");
            if let Some(old) = devices.remove(device_id) {
                old.shutdown().await;
            }
        }

        let session = session::spawn(
            device_id.to_string(),
            config,
            Arc::clone(&self.browser),
            Arc::clone(&self.broadcaster),
            self.reduced_motion,
        )
        .await?;
        devices.insert(device_id.to_string(), session);
        Ok(())
    }

    /// Navigate a device's target. Unknown devices are ignored.
    pub async fn navigate(&self, device_id: &str, url: String) {
        let devices = self.devices.lock().await;
        if let Some(session) = devices.get(device_id) {
            session.navigate(url).await;
        }
    }

    /// Latch a full-frame request for a device. Unknown devices are
    /// ignored.
    pub async fn request_full_frame(&self, device_id: &str) {
        let devices = self.devices.lock().await;
        if let Some(session) = devices.get(device_id) {
            session.request_full_frame().await;
        }
    }

    /// Destroy a session. Idempotent: removing an absent device is a
    /// no-op.
    pub async fn remove_device(&self, device_id: &str) {
        let session = self.devices.lock().await.remove(device_id);
        if let Some(session) = session {
            session.shutdown().await;
        }
    }

    /// Number of live sessions.
    pub async fn device_count(&self) -> usize {
        self.devices.lock().await.len()
    }

    /// Destroy every session whose last activity is older than `ttl`.
    ///
    /// Guarded: a sweep that starts while another is still running
    /// returns immediately. Returns the number of destroyed sessions.
    pub async fn cleanup_idle(&self, ttl: Duration) -> usize {
        if self
            .cleanup_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("idle sweep already running, skipping");
            return 0;
        }

        let cutoff = now_ms().saturating_sub(ttl.as_millis() as u64);
        let stale: Vec<String> = {
            let devices = self.devices.lock().await;
            devices
                .iter()
                .filter(|(_, s)| s.last_active_ms() < cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for device_id in &stale {
            info!(device = %device_id, "evicting idle session");
            self.remove_device(device_id).await;
        }

        self.cleanup_running.store(false, Ordering::SeqCst);
        stale.len()
    }

    /// Destroy every session (process shutdown).
    pub async fn shutdown_all(&self) {
        let sessions: Vec<DeviceSession> = {
            let mut devices = self.devices.lock().await;
            devices.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.shutdown().await;
        }
    }
}
