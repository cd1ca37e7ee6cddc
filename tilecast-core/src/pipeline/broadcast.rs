//! Per-device client fan-out with pacing and stale-frame dropping.
//!
//! The target displays sit behind slow, bufferbloat-prone links: the
//! producer can render ~48 fps while the transport absorbs 1–2 MB/s.
//! Without a gate, a content change queues behind seconds of stale
//! animation in the kernel's outbound buffer. The drain task therefore
//! keeps at most the newest queued frame, abandons a frame mid-sequence
//! when a newer one arrives, and after each delivered frame waits for the
//! client's outbound buffer to drain before sending the next.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::pipeline::processor::FrameOut;
use crate::protocol;

// ── Constants ────────────────────────────────────────────────────

/// Fixed gap after every delivered frame.
pub const MIN_FRAME_GAP_MS: u64 = 100;

/// Upper bound on the adaptive buffer-drain wait.
pub const DRAIN_MAX_MS: u64 = 2000;

/// Poll interval while waiting for buffers to drain.
pub const DRAIN_POLL_MS: u64 = 5;

/// Outbound-buffer low-water mark: pacing ends once every client is
/// below this.
pub const BACKPRESSURE_LOW: usize = 16 * 1024;

// ── ClientLink ───────────────────────────────────────────────────

/// Message handed to a link's writer task.
#[derive(Debug)]
pub enum LinkMessage {
    /// One binary protocol packet.
    Packet(Vec<u8>),
    /// Close the transport connection.
    Close,
}

/// Cheap cloneable handle to one connected display client.
///
/// The transport itself lives in a writer task owned by the server; this
/// handle only enqueues. `buffered_bytes` counts bytes accepted but not
/// yet flushed by the writer, which is the backpressure signal the drain
/// loop paces against.
#[derive(Debug, Clone)]
pub struct ClientLink {
    id: u64,
    tx: mpsc::UnboundedSender<LinkMessage>,
    buffered: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

/// Writer-side half of a [`ClientLink`].
#[derive(Debug)]
pub struct LinkBackend {
    /// Messages to write to the transport, in order.
    pub rx: mpsc::UnboundedReceiver<LinkMessage>,
    /// Decrement after a packet has been flushed.
    pub buffered: Arc<AtomicUsize>,
    /// Clear when the transport dies.
    pub open: Arc<AtomicBool>,
}

impl ClientLink {
    /// Create a link and its writer-side backend.
    pub fn channel(id: u64) -> (Self, LinkBackend) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(true));
        (
            Self {
                id,
                tx,
                buffered: Arc::clone(&buffered),
                open: Arc::clone(&open),
            },
            LinkBackend { rx, buffered, open },
        )
    }

    /// Identity of this connection within its device.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the transport is still writable.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Bytes enqueued but not yet flushed to the transport.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Enqueue one packet. Returns `false` if the link is dead.
    pub fn send(&self, packet: Vec<u8>) -> bool {
        if !self.is_open() {
            return false;
        }
        self.buffered.fetch_add(packet.len(), Ordering::Relaxed);
        if self.tx.send(LinkMessage::Packet(packet)).is_err() {
            self.open.store(false, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Ask the writer task to close the transport.
    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
        let _ = self.tx.send(LinkMessage::Close);
    }
}

// ── OutFrame ─────────────────────────────────────────────────────

/// One processed frame, packetized and ready to send.
#[derive(Debug)]
pub struct OutFrame {
    /// Frame id carried in the packet headers (0 for stats).
    pub frame_id: u32,
    /// Packets in send order.
    pub packets: Vec<Vec<u8>>,
}

// ── Broadcaster ──────────────────────────────────────────────────

struct DeviceChannel {
    clients: Vec<ClientLink>,
    queue: VecDeque<OutFrame>,
    sending: bool,
}

impl DeviceChannel {
    fn new() -> Self {
        Self {
            clients: Vec::new(),
            queue: VecDeque::new(),
            sending: false,
        }
    }
}

/// Process-wide per-device delivery state.
///
/// All locking is short and never spans an await; the drain task
/// snapshots the client set before iterating.
pub struct Broadcaster {
    devices: Mutex<HashMap<String, DeviceChannel>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Register a client connection for a device.
    ///
    /// One-display-one-viewer: any previously connected clients for the
    /// device are closed first, and frames queued for them are dropped
    /// (they predate the new viewer's state).
    pub fn add_client(&self, device_id: &str, link: ClientLink) {
        let mut devices = self.devices.lock();
        let channel = devices
            .entry(device_id.to_string())
            .or_insert_with(DeviceChannel::new);
        for old in channel.clients.drain(..) {
            debug!(device = device_id, client = old.id(), "replacing client");
            old.close();
        }
        channel.queue.clear();
        channel.clients.push(link);
    }

    /// Unregister a connection; drops all device state once the last
    /// client is gone.
    pub fn remove_client(&self, device_id: &str, link_id: u64) {
        let mut devices = self.devices.lock();
        if let Some(channel) = devices.get_mut(device_id) {
            channel.clients.retain(|c| c.id() != link_id);
            if channel.clients.is_empty() && !channel.sending {
                devices.remove(device_id);
            }
        }
    }

    /// Number of open connections for a device.
    pub fn client_count(&self, device_id: &str) -> usize {
        self.devices
            .lock()
            .get(device_id)
            .map(|ch| ch.clients.iter().filter(|c| c.is_open()).count())
            .unwrap_or(0)
    }

    /// Packetize a processed frame, enqueue it, and kick the drain.
    ///
    /// A frame for a device with no connected clients is dropped.
    pub fn send_frame_chunked(
        self: &Arc<Self>,
        device_id: &str,
        frame: &FrameOut,
        frame_id: u32,
        max_bytes: usize,
    ) {
        let packets = protocol::build_frame_packets(
            &frame.rects,
            frame.encoding,
            frame_id,
            frame.is_full_frame,
            max_bytes,
        );
        if packets.is_empty() {
            return;
        }
        self.enqueue(device_id, OutFrame { frame_id, packets });
    }

    /// Enqueue the distinguished self-test measurement packet.
    pub fn start_self_test(self: &Arc<Self>, device_id: &str, timestamp_ms: u64) {
        self.enqueue(
            device_id,
            OutFrame {
                frame_id: 0,
                packets: vec![protocol::build_stats_packet(timestamp_ms)],
            },
        );
    }

    // ── Internal ─────────────────────────────────────────────────

    fn enqueue(self: &Arc<Self>, device_id: &str, frame: OutFrame) {
        let mut devices = self.devices.lock();
        let Some(channel) = devices.get_mut(device_id) else {
            trace!(device = device_id, "dropping frame for device with no clients");
            return;
        };
        if channel.clients.is_empty() {
            return;
        }
        channel.queue.push_back(frame);
        if !channel.sending {
            channel.sending = true;
            let this = Arc::clone(self);
            let id = device_id.to_string();
            tokio::spawn(async move { this.drain(id).await });
        }
    }

    /// Whether a frame is waiting in the device's queue.
    fn has_queued(&self, device_id: &str) -> bool {
        self.devices
            .lock()
            .get(device_id)
            .map(|ch| !ch.queue.is_empty())
            .unwrap_or(false)
    }

    /// Largest outbound buffer among the device's open clients.
    fn max_buffered(&self, device_id: &str) -> usize {
        self.devices
            .lock()
            .get(device_id)
            .map(|ch| {
                ch.clients
                    .iter()
                    .filter(|c| c.is_open())
                    .map(ClientLink::buffered_bytes)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Pop the next frame to send, discarding everything but the newest.
    ///
    /// Returns `None` (and clears the `sending` flag under the same lock,
    /// so a concurrent enqueue cannot be missed) when the queue is empty
    /// or the device has no clients left.
    fn next_frame(&self, device_id: &str) -> Option<(OutFrame, Vec<ClientLink>)> {
        let mut devices = self.devices.lock();
        let channel = devices.get_mut(device_id)?;

        if channel.clients.is_empty() {
            channel.queue.clear();
            channel.sending = false;
            devices.remove(device_id);
            return None;
        }

        let stale = channel.queue.len().saturating_sub(1);
        if stale > 0 {
            debug!(device = device_id, dropped = stale, "dropping stale frames");
            channel.queue.drain(..stale);
        }

        match channel.queue.pop_front() {
            Some(frame) => Some((frame, channel.clients.clone())),
            None => {
                channel.sending = false;
                None
            }
        }
    }

    /// Drop connections that died mid-send.
    fn reap_clients(&self, device_id: &str, dead: &[u64]) {
        for &id in dead {
            self.remove_client(device_id, id);
        }
    }

    /// Single per-device drain task. Runs while the queue is non-empty.
    async fn drain(self: Arc<Self>, device_id: String) {
        loop {
            let Some((frame, clients)) = self.next_frame(&device_id) else {
                return;
            };

            let mut aborted = false;
            for packet in &frame.packets {
                // A newer frame obsoletes the rest of this one.
                if self.has_queued(&device_id) {
                    trace!(
                        device = %device_id,
                        frame = frame.frame_id,
                        "aborting frame mid-sequence for newer frame"
                    );
                    aborted = true;
                    break;
                }

                let mut dead = Vec::new();
                for client in &clients {
                    if !client.is_open() || !client.send(packet.clone()) {
                        client.close();
                        dead.push(client.id());
                    }
                }
                if !dead.is_empty() {
                    self.reap_clients(&device_id, &dead);
                }

                tokio::task::yield_now().await;
            }

            if aborted {
                continue;
            }

            // Pacing: fixed gap, then wait for buffers to drain — unless a
            // newer frame shows up, which ends the wait immediately.
            tokio::time::sleep(Duration::from_millis(MIN_FRAME_GAP_MS)).await;
            let deadline = Instant::now() + Duration::from_millis(DRAIN_MAX_MS);
            loop {
                if self.has_queued(&device_id) {
                    break;
                }
                if self.max_buffered(&device_id) < BACKPRESSURE_LOW {
                    break;
                }
                if Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(DRAIN_POLL_MS)).await;
            }
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processor::{FrameEncoding, FrameOut, TileRect};
    use crate::protocol::PacketHeader;

    fn test_frame(frame_id_marker: u8) -> FrameOut {
        FrameOut {
            rects: vec![TileRect {
                x: 0,
                y: 0,
                w: 32,
                h: 32,
                data: vec![frame_id_marker; 64],
            }],
            encoding: FrameEncoding::Jpeg444,
            is_full_frame: true,
        }
    }

    async fn collect_packets(backend: &mut LinkBackend, wait_ms: u64) -> Vec<Vec<u8>> {
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        let mut packets = Vec::new();
        while let Ok(msg) = backend.rx.try_recv() {
            if let LinkMessage::Packet(p) = msg {
                backend.buffered.fetch_sub(p.len(), Ordering::Relaxed);
                packets.push(p);
            }
        }
        packets
    }

    #[tokio::test]
    async fn add_client_replaces_previous() {
        let b = Arc::new(Broadcaster::new());
        let (first, mut first_backend) = ClientLink::channel(1);
        let (second, _second_backend) = ClientLink::channel(2);

        b.add_client("dev", first.clone());
        assert_eq!(b.client_count("dev"), 1);

        b.add_client("dev", second);
        assert_eq!(b.client_count("dev"), 1);
        assert!(!first.is_open());
        assert!(matches!(
            first_backend.rx.try_recv(),
            Ok(LinkMessage::Close)
        ));
    }

    #[tokio::test]
    async fn remove_last_client_discards_state() {
        let b = Arc::new(Broadcaster::new());
        let (link, _backend) = ClientLink::channel(1);
        b.add_client("dev", link);
        b.remove_client("dev", 1);
        assert_eq!(b.client_count("dev"), 0);
        assert!(!b.has_queued("dev"));
    }

    #[tokio::test]
    async fn frame_reaches_connected_client() {
        let b = Arc::new(Broadcaster::new());
        let (link, mut backend) = ClientLink::channel(1);
        b.add_client("dev", link);

        b.send_frame_chunked("dev", &test_frame(1), 7, 32 * 1024);
        let packets = collect_packets(&mut backend, 50).await;
        assert_eq!(packets.len(), 1);
        let hdr = PacketHeader::decode(&packets[0]).unwrap();
        assert_eq!(hdr.frame_id, 7);
        assert!(hdr.is_full_frame);
    }

    #[tokio::test]
    async fn frames_for_clientless_device_are_dropped() {
        let b = Arc::new(Broadcaster::new());
        b.send_frame_chunked("ghost", &test_frame(1), 1, 32 * 1024);
        assert!(!b.has_queued("ghost"));
    }

    #[tokio::test]
    async fn queued_backlog_keeps_only_newest() {
        let b = Arc::new(Broadcaster::new());
        let (link, mut backend) = ClientLink::channel(1);
        b.add_client("dev", link);

        // Three frames enqueued back to back; the drain task has not run
        // yet on a current-thread runtime, so they pile up.
        for id in 1..=3 {
            b.send_frame_chunked("dev", &test_frame(id as u8), id, 32 * 1024);
        }

        let packets = collect_packets(&mut backend, 50).await;
        assert_eq!(packets.len(), 1);
        let hdr = PacketHeader::decode(&packets[0]).unwrap();
        assert_eq!(hdr.frame_id, 3);
    }

    #[tokio::test]
    async fn backpressure_holds_next_frame_until_buffer_drains() {
        let b = Arc::new(Broadcaster::new());
        let (link, mut backend) = ClientLink::channel(1);
        b.add_client("dev", link);

        // First frame goes out, but the client never flushes it and we
        // inflate its buffer above the low-water mark.
        b.send_frame_chunked("dev", &test_frame(1), 1, 32 * 1024);
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.buffered.fetch_add(BACKPRESSURE_LOW * 2, Ordering::Relaxed);

        // Second frame: pacing is still waiting on the fat buffer after
        // the 100 ms gap...
        b.send_frame_chunked("dev", &test_frame(2), 2, 32 * 1024);
        // ...but a queued newer frame ends the wait immediately, so it
        // arrives well before DRAIN_MAX_MS.
        tokio::time::sleep(Duration::from_millis(MIN_FRAME_GAP_MS + 100)).await;

        let mut frame_ids = Vec::new();
        while let Ok(LinkMessage::Packet(p)) = backend.rx.try_recv() {
            frame_ids.push(PacketHeader::decode(&p).unwrap().frame_id);
        }
        assert_eq!(frame_ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn dead_client_is_reaped_on_send() {
        let b = Arc::new(Broadcaster::new());
        let (link, backend) = ClientLink::channel(1);
        b.add_client("dev", link);
        drop(backend); // writer gone: sends will fail

        b.send_frame_chunked("dev", &test_frame(1), 1, 32 * 1024);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.client_count("dev"), 0);
    }

    #[tokio::test]
    async fn self_test_packet_is_stats_kind() {
        let b = Arc::new(Broadcaster::new());
        let (link, mut backend) = ClientLink::channel(1);
        b.add_client("dev", link);

        b.start_self_test("dev", 123_456);
        let packets = collect_packets(&mut backend, 50).await;
        assert_eq!(packets.len(), 1);
        let hdr = PacketHeader::decode(&packets[0]).unwrap();
        assert_eq!(hdr.kind, crate::protocol::PacketKind::Stats);
        assert_eq!(hdr.frame_id, 0);
    }
}
