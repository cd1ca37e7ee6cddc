//! Per-device streaming session.
//!
//! Each session owns one browser target and runs a single-consumer event
//! loop: screencast frames, DOM-mutation hints and control messages all
//! land in the same task, which also owns the pending-frame slot and both
//! timers. That serialisation is what guarantees at most one in-flight
//! frame per device and at most one armed throttle/fallback deadline —
//! there is no mutex to get wrong.
//!
//! ```text
//! CDP events ─┐
//!             ├─► event loop ─► hash gate ─► decode ─► rotate ─► diff ─► broadcaster
//! control  ──┘        │
//!                 throttle / fallback deadlines
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cdp::{Browser, PageEvent, MUTATION_BINDING};
use crate::config::DeviceConfig;
use crate::error::CastError;
use crate::hash::fnv1a32;
use crate::pipeline::broadcast::Broadcaster;
use crate::pipeline::processor::FrameProcessor;
use crate::pipeline::raster::Raster;

// ── Constants ────────────────────────────────────────────────────

/// Fallback screenshot fires this long after the last screencast frame.
pub const FALLBACK_DELAY_MS: u64 = 800;

/// Fallback re-arm interval while clients are connected.
pub const FALLBACK_REPEAT_MS: u64 = 2000;

/// Fallback recheck interval while no clients are connected.
pub const FALLBACK_IDLE_RECHECK_MS: u64 = 5000;

/// Script installed on every new document: reports DOM mutations through
/// the page binding so a change on an otherwise compositor-quiet page
/// still reaches the server promptly.
const MUTATION_OBSERVER_JS: &str = r#"(() => {
  if (window.__tilecast_observer) return;
  const notify = () => { try { window.__tilecast_mutation(''); } catch (e) {} };
  const observer = new MutationObserver(notify);
  const start = () => observer.observe(document.documentElement, {
    childList: true, subtree: true, attributes: true, characterData: true,
  });
  if (document.documentElement) start();
  else document.addEventListener('DOMContentLoaded', start);
  window.__tilecast_observer = observer;
})();"#;

// ── SessionEvent ─────────────────────────────────────────────────

/// Control messages accepted by a session's event loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// Latch a full frame for the next processed raster.
    RequestFullFrame,
    /// Navigate the target to a URL (no-op if already there).
    Navigate(String),
    /// Stop the loop and release the browser target.
    Shutdown,
}

// ── DeviceSession ────────────────────────────────────────────────

/// Handle to a running session, held by the registry.
pub struct DeviceSession {
    device_id: String,
    target_id: String,
    config: DeviceConfig,
    control: mpsc::Sender<SessionEvent>,
    last_active: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl DeviceSession {
    /// Client-chosen device identifier.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Browser target backing this session.
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// The immutable config this session was built from.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Wall-clock milliseconds of the last activity.
    pub fn last_active_ms(&self) -> u64 {
        self.last_active.load(Ordering::Relaxed)
    }

    /// Mark the session active now (e.g. on client join).
    pub fn touch(&self) {
        self.last_active.store(now_ms(), Ordering::Relaxed);
    }

    /// Latch a full frame for the next processed raster.
    pub async fn request_full_frame(&self) {
        let _ = self.control.send(SessionEvent::RequestFullFrame).await;
    }

    /// Navigate the target.
    pub async fn navigate(&self, url: String) {
        let _ = self.control.send(SessionEvent::Navigate(url)).await;
    }

    /// Stop the loop and wait for teardown to finish.
    pub(crate) async fn shutdown(self) {
        let _ = self.control.send(SessionEvent::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Create the browser target, start the screencast, and spawn the
/// session's event loop.
///
/// Failures here are terminal: a half-built target is closed best-effort
/// and the error propagates to the caller.
pub(crate) async fn spawn(
    device_id: String,
    config: DeviceConfig,
    browser: Arc<Browser>,
    broadcaster: Arc<Broadcaster>,
    reduced_motion: bool,
) -> Result<DeviceSession, CastError> {
    let target_id = browser.create_target(config.width, config.height).await?;

    match setup_target(&browser, &target_id, &config, reduced_motion).await {
        Ok(cdp_session) => {
            let (page_tx, page_rx) = mpsc::channel(32);
            let (control_tx, control_rx) = mpsc::channel(16);
            browser.register_route(&cdp_session, page_tx);

            let last_active = Arc::new(AtomicU64::new(now_ms()));
            let mut processor = FrameProcessor::new(&config);
            processor.request_full_frame();

            let event_loop = SessionLoop {
                device_id: device_id.clone(),
                target_id: target_id.clone(),
                cdp_session,
                config: config.clone(),
                browser,
                broadcaster,
                processor,
                prev_frame_hash: None,
                frame_id: 0,
                pending: None,
                throttle_at: None,
                fallback_at: Instant::now() + Duration::from_millis(FALLBACK_DELAY_MS),
                fallback_armed: true,
                last_processed: None,
                current_url: None,
                last_active: Arc::clone(&last_active),
            };
            let task = tokio::spawn(event_loop.run(page_rx, control_rx));

            info!(device = %device_id, target = %target_id, "session started");
            Ok(DeviceSession {
                device_id,
                target_id,
                config,
                control: control_tx,
                last_active,
                task,
            })
        }
        Err(e) => {
            if let Err(close_err) = browser.close_target(&target_id).await {
                warn!(target = %target_id, "failed to close half-built target: {close_err}");
            }
            Err(e)
        }
    }
}

/// Attach and configure a freshly created target: page events, device
/// metrics, optional reduced-motion emulation, the mutation binding, and
/// the screencast itself.
async fn setup_target(
    browser: &Browser,
    target_id: &str,
    config: &DeviceConfig,
    reduced_motion: bool,
) -> Result<String, CastError> {
    let session = browser.attach(target_id).await?;

    browser
        .session_command(&session, "Page.enable", json!({}))
        .await?;
    browser
        .session_command(
            &session,
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": config.width,
                "height": config.height,
                "deviceScaleFactor": 1,
                "mobile": true,
            }),
        )
        .await?;
    if reduced_motion {
        browser
            .session_command(
                &session,
                "Emulation.setEmulatedMedia",
                json!({
                    "features": [{ "name": "prefers-reduced-motion", "value": "reduce" }],
                }),
            )
            .await?;
    }
    browser
        .session_command(&session, "Runtime.enable", json!({}))
        .await?;
    browser
        .session_command(&session, "Runtime.addBinding", json!({ "name": MUTATION_BINDING }))
        .await?;
    browser
        .session_command(
            &session,
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": MUTATION_OBSERVER_JS }),
        )
        .await?;
    browser
        .session_command(
            &session,
            "Page.startScreencast",
            json!({
                "format": "png",
                "maxWidth": config.width,
                "maxHeight": config.height,
                "everyNthFrame": config.every_nth_frame,
            }),
        )
        .await?;

    Ok(session)
}

// ── SessionLoop ──────────────────────────────────────────────────

/// State owned exclusively by the session task.
struct SessionLoop {
    device_id: String,
    target_id: String,
    cdp_session: String,
    config: DeviceConfig,
    browser: Arc<Browser>,
    broadcaster: Arc<Broadcaster>,

    processor: FrameProcessor,
    /// Hash of the last encoded frame that survived the equality check.
    prev_frame_hash: Option<u32>,
    /// Advances only when the processor emits a non-empty rect set.
    frame_id: u32,
    /// Most recent unprocessed encoded frame. Newer arrivals overwrite.
    pending: Option<Vec<u8>>,
    /// Throttle deadline; `None` means not armed.
    throttle_at: Option<Instant>,
    fallback_at: Instant,
    fallback_armed: bool,
    last_processed: Option<Instant>,
    current_url: Option<String>,
    last_active: Arc<AtomicU64>,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut page_rx: mpsc::Receiver<PageEvent>,
        mut control_rx: mpsc::Receiver<SessionEvent>,
    ) {
        loop {
            let throttle_deadline = self.throttle_at.unwrap_or_else(far_future);
            let fallback_deadline = if self.fallback_armed {
                self.fallback_at
            } else {
                far_future()
            };

            tokio::select! {
                ev = control_rx.recv() => match ev {
                    None | Some(SessionEvent::Shutdown) => break,
                    Some(SessionEvent::RequestFullFrame) => {
                        self.processor.request_full_frame();
                    }
                    Some(SessionEvent::Navigate(url)) => self.navigate(url).await,
                },
                ev = page_rx.recv() => match ev {
                    None => {
                        warn!(device = %self.device_id, "browser event stream ended");
                        break;
                    }
                    Some(PageEvent::Detached) => {
                        warn!(device = %self.device_id, "target detached");
                        break;
                    }
                    Some(PageEvent::ScreencastFrame { data }) => self.on_screencast_frame(data),
                    Some(PageEvent::MutationHint) => {
                        // Cut the idle wait: capture as soon as the loop is free.
                        self.fallback_at = Instant::now();
                        self.fallback_armed = true;
                    }
                },
                _ = tokio::time::sleep_until(throttle_deadline), if self.throttle_at.is_some() => {
                    self.flush_pending();
                }
                _ = tokio::time::sleep_until(fallback_deadline), if self.fallback_armed => {
                    self.fallback_capture().await;
                }
            }
        }

        self.teardown().await;
    }

    // ── Event handlers ───────────────────────────────────────────

    /// Screencast frame (already acked and decoded from base64).
    fn on_screencast_frame(&mut self, data: Vec<u8>) {
        // The screencast is demonstrably live; push the fallback out.
        self.fallback_at = Instant::now() + Duration::from_millis(FALLBACK_DELAY_MS);
        self.fallback_armed = true;

        if self.broadcaster.client_count(&self.device_id) == 0 {
            return;
        }

        self.last_active.store(now_ms(), Ordering::Relaxed);
        self.pending = Some(data);
        self.arm_throttle();
    }

    /// Arm the throttle deadline so the minimum inter-processing gap is
    /// kept, while a long-delayed frame is processed promptly.
    fn arm_throttle(&mut self) {
        if self.throttle_at.is_some() {
            return;
        }
        let since_last = self.last_processed.map(|t| t.elapsed());
        let delay = throttle_delay(self.config.min_frame_interval_ms, since_last);
        self.throttle_at = Some(Instant::now() + delay);
    }

    /// Process the pending frame: identity gate, decode, rotate, diff,
    /// broadcast. Errors are logged and do not poison session state.
    fn flush_pending(&mut self) {
        self.throttle_at = None;
        let Some(bytes) = self.pending.take() else {
            return;
        };

        let hash = fnv1a32(&bytes);
        if self.prev_frame_hash == Some(hash) {
            // Identical bytes: drop before paying for a decode.
            self.last_processed = Some(Instant::now());
            return;
        }
        self.prev_frame_hash = Some(hash);

        if let Err(e) = self.process(&bytes) {
            warn!(device = %self.device_id, "frame processing failed: {e}");
        }
        self.last_processed = Some(Instant::now());
    }

    fn process(&mut self, bytes: &[u8]) -> Result<(), CastError> {
        let raster = Raster::decode_png(bytes)?.rotated(self.config.rotation)?;
        let out = self.processor.process_frame(&raster)?;
        if !out.is_empty() {
            self.frame_id = self.frame_id.wrapping_add(1);
            self.broadcaster.send_frame_chunked(
                &self.device_id,
                &out,
                self.frame_id,
                self.config.max_bytes_per_message,
            );
        }
        Ok(())
    }

    /// Polled screenshot for compositor-quiet pages.
    async fn fallback_capture(&mut self) {
        if self.broadcaster.client_count(&self.device_id) == 0 {
            // Cheap recheck while nobody is watching.
            self.fallback_at = Instant::now() + Duration::from_millis(FALLBACK_IDLE_RECHECK_MS);
            return;
        }

        match self
            .browser
            .session_command(&self.cdp_session, "Page.captureScreenshot", json!({ "format": "png" }))
            .await
        {
            Ok(result) => {
                let decoded = result["data"]
                    .as_str()
                    .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok());
                match decoded {
                    Some(bytes) => {
                        self.processor.request_full_frame();
                        self.pending = Some(bytes);
                        self.throttle_at = Some(Instant::now());
                    }
                    None => warn!(device = %self.device_id, "screenshot response without image data"),
                }
            }
            Err(e) => {
                if is_terminal_browser_error(&e) {
                    warn!(device = %self.device_id, "fallback capture disabled: {e}");
                    self.fallback_armed = false;
                    return;
                }
                debug!(device = %self.device_id, "fallback capture failed: {e}");
            }
        }

        self.fallback_at = Instant::now() + Duration::from_millis(FALLBACK_REPEAT_MS);
    }

    async fn navigate(&mut self, url: String) {
        if self.current_url.as_deref() == Some(url.as_str()) {
            return;
        }
        match self
            .browser
            .session_command(&self.cdp_session, "Page.navigate", json!({ "url": url }))
            .await
        {
            Ok(_) => {
                info!(device = %self.device_id, url = %url, "navigated");
                self.current_url = Some(url);
            }
            Err(e) => warn!(device = %self.device_id, url = %url, "navigation failed: {e}"),
        }
    }

    /// Best-effort release of the browser resources. Dropping the loop
    /// also drops both deadlines, so no timer can outlive the session.
    async fn teardown(self) {
        if let Err(e) = self
            .browser
            .session_command(&self.cdp_session, "Page.stopScreencast", json!({}))
            .await
        {
            debug!(device = %self.device_id, "stop screencast failed: {e}");
        }
        if let Err(e) = self.browser.close_target(&self.target_id).await {
            warn!(device = %self.device_id, target = %self.target_id, "failed to close target: {e}");
        }
        self.browser.unregister_route(&self.cdp_session);
        info!(device = %self.device_id, "session ended");
    }
}

// ── Helpers ──────────────────────────────────────────────────────

/// Delay before the next processing pass: the remainder of the minimum
/// interval, or zero when enough time has already passed.
fn throttle_delay(min_interval_ms: u64, since_last: Option<Duration>) -> Duration {
    let interval = Duration::from_millis(min_interval_ms);
    match since_last {
        Some(elapsed) => interval.saturating_sub(elapsed),
        None => Duration::ZERO,
    }
}

/// Command failures that mean the target is gone for good.
fn is_terminal_browser_error(e: &CastError) -> bool {
    match e {
        CastError::CommandFailed { reason, .. } => {
            let reason = reason.to_ascii_lowercase();
            reason.contains("closed")
                || reason.contains("detached")
                || reason.contains("no session")
                || reason.contains("not found")
        }
        CastError::ChannelClosed => true,
        _ => false,
    }
}

/// Wall clock in epoch milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_delay_immediate_when_never_processed() {
        assert_eq!(throttle_delay(200, None), Duration::ZERO);
    }

    #[test]
    fn throttle_delay_remainder_of_interval() {
        let d = throttle_delay(200, Some(Duration::from_millis(150)));
        assert_eq!(d, Duration::from_millis(50));
    }

    #[test]
    fn throttle_delay_zero_after_long_gap() {
        let d = throttle_delay(200, Some(Duration::from_secs(5)));
        assert_eq!(d, Duration::ZERO);
    }

    #[test]
    fn throttle_delay_zero_interval_never_waits() {
        assert_eq!(throttle_delay(0, Some(Duration::ZERO)), Duration::ZERO);
    }

    #[test]
    fn terminal_errors_classified() {
        let terminal = CastError::CommandFailed {
            method: "Page.captureScreenshot".into(),
            reason: "Session closed".into(),
        };
        assert!(is_terminal_browser_error(&terminal));

        let transient = CastError::CommandFailed {
            method: "Page.captureScreenshot".into(),
            reason: "Timed out waiting for compositor".into(),
        };
        assert!(!is_terminal_browser_error(&transient));

        assert!(!is_terminal_browser_error(&CastError::Other("x".into())));
    }

    #[test]
    fn mutation_script_calls_the_binding() {
        assert!(MUTATION_OBSERVER_JS.contains(MUTATION_BINDING));
    }
}
