//! Wire protocol for tile frame delivery.
//!
//! Each WebSocket binary message carries exactly one packet. Packets are
//! self-describing: a client can resynchronise on any packet boundary,
//! which matters because the broadcaster may abandon the tail of a frame
//! when a newer one arrives.
//!
//! ## Wire format
//!
//! **Packet header** (16 bytes, little-endian):
//! ```text
//! magic:         u16  (2)  "TC"
//! version:       u8   (1)  currently 1
//! kind:          u8   (1)  1 = frame, 2 = stats
//! frame_id:      u32  (4)
//! packet_index:  u16  (2)
//! packet_count:  u16  (2)
//! flags:         u8   (1)  bit 0 = full frame
//! encoding:      u8   (1)  1 = JPEG 4:4:4 (0 for stats packets)
//! rect_count:    u16  (2)
//! ```
//!
//! **Rect entry** (12 byte header + payload), repeated `rect_count` times:
//! ```text
//! x:       u16  (2)
//! y:       u16  (2)
//! width:   u16  (2)
//! height:  u16  (2)
//! len:     u32  (4)
//! payload: [u8] (len)  encoded image data
//! ```
//!
//! **Stats packet**: a frame-shaped header with `kind = 2`, `frame_id = 0`
//! and `rect_count = 0`, followed by an 8-byte epoch-millisecond timestamp.
//! Used for self-test latency measurement.

use crate::error::CastError;
use crate::pipeline::processor::{FrameEncoding, TileRect};

// ── Constants ────────────────────────────────────────────────────

/// Leading magic bytes of every packet.
pub const MAGIC: [u8; 2] = *b"TC";

/// Current protocol version.
pub const VERSION: u8 = 1;

/// Encoded header size on the wire.
pub const HEADER_SIZE: usize = 16;

/// Per-rect header size on the wire.
pub const RECT_HEADER_SIZE: usize = 12;

/// Flag bit: this packet belongs to a full frame.
pub const FLAG_FULL_FRAME: u8 = 0x01;

// ── PacketKind ───────────────────────────────────────────────────

/// Discriminates frame packets from control-style packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Tile rectangles of a processed frame.
    Frame,
    /// Self-test measurement packet.
    Stats,
}

impl PacketKind {
    fn wire(self) -> u8 {
        match self {
            PacketKind::Frame => 1,
            PacketKind::Stats => 2,
        }
    }

    fn from_wire(value: u8) -> Result<Self, CastError> {
        match value {
            1 => Ok(PacketKind::Frame),
            2 => Ok(PacketKind::Stats),
            _ => Err(CastError::InvalidPacket("unknown packet kind")),
        }
    }
}

// ── PacketHeader ─────────────────────────────────────────────────

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub frame_id: u32,
    pub packet_index: u16,
    pub packet_count: u16,
    pub is_full_frame: bool,
    pub encoding: u8,
    pub rect_count: u16,
}

impl PacketHeader {
    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&MAGIC);
        buf[2] = VERSION;
        buf[3] = self.kind.wire();
        buf[4..8].copy_from_slice(&self.frame_id.to_le_bytes());
        buf[8..10].copy_from_slice(&self.packet_index.to_le_bytes());
        buf[10..12].copy_from_slice(&self.packet_count.to_le_bytes());
        buf[12] = if self.is_full_frame { FLAG_FULL_FRAME } else { 0 };
        buf[13] = self.encoding;
        buf[14..16].copy_from_slice(&self.rect_count.to_le_bytes());
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, CastError> {
        if data.len() < HEADER_SIZE {
            return Err(CastError::InvalidPacket("header too short"));
        }
        if data[0..2] != MAGIC {
            return Err(CastError::InvalidPacket("bad magic"));
        }
        if data[2] != VERSION {
            return Err(CastError::InvalidPacket("unsupported version"));
        }
        Ok(Self {
            kind: PacketKind::from_wire(data[3])?,
            frame_id: u32::from_le_bytes(data[4..8].try_into().map_err(|_| CastError::InvalidPacket("header"))?),
            packet_index: u16::from_le_bytes(data[8..10].try_into().map_err(|_| CastError::InvalidPacket("header"))?),
            packet_count: u16::from_le_bytes(data[10..12].try_into().map_err(|_| CastError::InvalidPacket("header"))?),
            is_full_frame: data[12] & FLAG_FULL_FRAME != 0,
            encoding: data[13],
            rect_count: u16::from_le_bytes(data[14..16].try_into().map_err(|_| CastError::InvalidPacket("header"))?),
        })
    }
}

// ── Frame packet building ────────────────────────────────────────

/// Wire size of one rect entry including its payload.
fn rect_wire_size(rect: &TileRect) -> usize {
    RECT_HEADER_SIZE + rect.data.len()
}

/// Packetize a processed frame's rectangles.
///
/// Whole rects are packed greedily, in their deterministic row-major
/// order, until adding another would exceed `max_bytes`. Every packet
/// carries at least one rect, so a single rect larger than `max_bytes`
/// travels alone rather than being split. An empty rect list yields no
/// packets.
pub fn build_frame_packets(
    rects: &[TileRect],
    encoding: FrameEncoding,
    frame_id: u32,
    is_full_frame: bool,
    max_bytes: usize,
) -> Vec<Vec<u8>> {
    if rects.is_empty() {
        return Vec::new();
    }

    // First pass: group rects into packets without exceeding max_bytes.
    let mut groups: Vec<&[TileRect]> = Vec::new();
    let mut start = 0;
    let mut size = HEADER_SIZE;
    for (i, rect) in rects.iter().enumerate() {
        let extra = rect_wire_size(rect);
        if i > start && size + extra > max_bytes {
            groups.push(&rects[start..i]);
            start = i;
            size = HEADER_SIZE;
        }
        size += extra;
    }
    groups.push(&rects[start..]);

    // Second pass: serialize, now that packet_count is known.
    let packet_count = groups.len() as u16;
    groups
        .iter()
        .enumerate()
        .map(|(index, group)| {
            let header = PacketHeader {
                kind: PacketKind::Frame,
                frame_id,
                packet_index: index as u16,
                packet_count,
                is_full_frame,
                encoding: encoding.wire(),
                rect_count: group.len() as u16,
            };
            let body: usize = group.iter().map(rect_wire_size).sum();
            let mut packet = Vec::with_capacity(HEADER_SIZE + body);
            packet.extend_from_slice(&header.encode());
            for rect in *group {
                packet.extend_from_slice(&(rect.x as u16).to_le_bytes());
                packet.extend_from_slice(&(rect.y as u16).to_le_bytes());
                packet.extend_from_slice(&(rect.w as u16).to_le_bytes());
                packet.extend_from_slice(&(rect.h as u16).to_le_bytes());
                packet.extend_from_slice(&(rect.data.len() as u32).to_le_bytes());
                packet.extend_from_slice(&rect.data);
            }
            packet
        })
        .collect()
}

/// Build the self-test measurement packet.
pub fn build_stats_packet(timestamp_ms: u64) -> Vec<u8> {
    let header = PacketHeader {
        kind: PacketKind::Stats,
        frame_id: 0,
        packet_index: 0,
        packet_count: 1,
        is_full_frame: false,
        encoding: 0,
        rect_count: 0,
    };
    let mut packet = Vec::with_capacity(HEADER_SIZE + 8);
    packet.extend_from_slice(&header.encode());
    packet.extend_from_slice(&timestamp_ms.to_le_bytes());
    packet
}

/// Parse the rect entries following a frame packet header.
///
/// Primarily for tests and reference clients; the server never decodes
/// its own packets.
pub fn decode_rects(data: &[u8], rect_count: u16) -> Result<Vec<TileRect>, CastError> {
    let mut rects = Vec::with_capacity(rect_count as usize);
    let mut offset = HEADER_SIZE;
    for _ in 0..rect_count {
        if offset + RECT_HEADER_SIZE > data.len() {
            return Err(CastError::InvalidPacket("truncated rect header"));
        }
        let x = u16::from_le_bytes(data[offset..offset + 2].try_into().map_err(|_| CastError::InvalidPacket("rect"))?);
        let y = u16::from_le_bytes(data[offset + 2..offset + 4].try_into().map_err(|_| CastError::InvalidPacket("rect"))?);
        let w = u16::from_le_bytes(data[offset + 4..offset + 6].try_into().map_err(|_| CastError::InvalidPacket("rect"))?);
        let h = u16::from_le_bytes(data[offset + 6..offset + 8].try_into().map_err(|_| CastError::InvalidPacket("rect"))?);
        let len = u32::from_le_bytes(data[offset + 8..offset + 12].try_into().map_err(|_| CastError::InvalidPacket("rect"))?) as usize;
        offset += RECT_HEADER_SIZE;

        if offset + len > data.len() {
            return Err(CastError::InvalidPacket("truncated rect payload"));
        }
        rects.push(TileRect {
            x: u32::from(x),
            y: u32::from(y),
            w: u32::from(w),
            h: u32::from(h),
            data: data[offset..offset + len].to_vec(),
        });
        offset += len;
    }
    Ok(rects)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: u32, y: u32, payload_len: usize) -> TileRect {
        TileRect {
            x,
            y,
            w: 32,
            h: 32,
            data: vec![0xAB; payload_len],
        }
    }

    #[test]
    fn header_roundtrip() {
        let hdr = PacketHeader {
            kind: PacketKind::Frame,
            frame_id: 0xDEAD_BEEF,
            packet_index: 3,
            packet_count: 7,
            is_full_frame: true,
            encoding: FrameEncoding::Jpeg444.wire(),
            rect_count: 12,
        };
        let decoded = PacketHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = PacketHeader {
            kind: PacketKind::Frame,
            frame_id: 1,
            packet_index: 0,
            packet_count: 1,
            is_full_frame: false,
            encoding: 1,
            rect_count: 0,
        }
        .encode();
        bytes[0] = b'X';
        assert!(PacketHeader::decode(&bytes).is_err());
    }

    #[test]
    fn header_rejects_short_input() {
        assert!(PacketHeader::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn single_small_frame_is_one_packet() {
        let rects = vec![rect(0, 0, 100), rect(32, 0, 100)];
        let packets = build_frame_packets(&rects, FrameEncoding::Jpeg444, 5, false, 32 * 1024);
        assert_eq!(packets.len(), 1);

        let hdr = PacketHeader::decode(&packets[0]).unwrap();
        assert_eq!(hdr.frame_id, 5);
        assert_eq!(hdr.packet_count, 1);
        assert_eq!(hdr.rect_count, 2);
        assert!(!hdr.is_full_frame);

        let decoded = decode_rects(&packets[0], hdr.rect_count).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].x, 32);
        assert_eq!(decoded[1].data.len(), 100);
    }

    #[test]
    fn chunking_respects_max_bytes() {
        let rects: Vec<TileRect> = (0..8).map(|i| rect(i * 32, 0, 400)).collect();
        // Each rect is 412 wire bytes; a 1000-byte budget fits two per packet.
        let packets = build_frame_packets(&rects, FrameEncoding::Jpeg444, 1, false, 1000);
        assert_eq!(packets.len(), 4);
        for p in &packets {
            assert!(p.len() <= 1000);
        }
        let first = PacketHeader::decode(&packets[0]).unwrap();
        let last = PacketHeader::decode(&packets[3]).unwrap();
        assert_eq!(first.packet_count, 4);
        assert_eq!(last.packet_index, 3);
        assert_eq!(first.rect_count, 2);
    }

    #[test]
    fn oversized_rect_travels_alone() {
        let rects = vec![rect(0, 0, 5000), rect(32, 0, 10)];
        let packets = build_frame_packets(&rects, FrameEncoding::Jpeg444, 1, true, 1024);
        assert_eq!(packets.len(), 2);
        assert!(packets[0].len() > 1024);
        let hdr = PacketHeader::decode(&packets[0]).unwrap();
        assert_eq!(hdr.rect_count, 1);
        assert!(hdr.is_full_frame);
    }

    #[test]
    fn empty_rect_list_yields_no_packets() {
        let packets = build_frame_packets(&[], FrameEncoding::Jpeg444, 1, false, 1024);
        assert!(packets.is_empty());
    }

    #[test]
    fn rect_order_is_preserved() {
        let rects: Vec<TileRect> = (0..5).map(|i| rect(i * 32, i * 32, 16)).collect();
        let packets = build_frame_packets(&rects, FrameEncoding::Jpeg444, 9, false, 64 * 1024);
        let hdr = PacketHeader::decode(&packets[0]).unwrap();
        let decoded = decode_rects(&packets[0], hdr.rect_count).unwrap();
        let xs: Vec<u32> = decoded.iter().map(|r| r.x).collect();
        assert_eq!(xs, vec![0, 32, 64, 96, 128]);
    }

    #[test]
    fn stats_packet_shape() {
        let packet = build_stats_packet(1_720_000_000_123);
        let hdr = PacketHeader::decode(&packet).unwrap();
        assert_eq!(hdr.kind, PacketKind::Stats);
        assert_eq!(hdr.frame_id, 0);
        assert_eq!(hdr.rect_count, 0);
        assert_eq!(packet.len(), HEADER_SIZE + 8);

        let ts = u64::from_le_bytes(packet[HEADER_SIZE..].try_into().unwrap());
        assert_eq!(ts, 1_720_000_000_123);
    }
}
