//! Raster decode / rotate / encode adapter over the `image` crate.
//!
//! The pipeline works on tightly-packed RGBA buffers. Screencast and
//! screenshot payloads arrive as PNG; outgoing tiles leave as JPEG. The
//! `image` JPEG encoder does not subsample chroma, so gradients survive
//! without block artifacts on the target displays.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, ImageFormat, RgbImage, RgbaImage};

use crate::config::Rotation;
use crate::error::CastError;

// ── Raster ───────────────────────────────────────────────────────

/// A decoded frame: `width * height * 4` tightly-packed RGBA bytes.
#[derive(Debug, Clone)]
pub struct Raster {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel data, 4 bytes per pixel, no row padding.
    pub data: Vec<u8>,
}

impl Raster {
    /// Decode a PNG byte buffer into an RGBA raster.
    pub fn decode_png(bytes: &[u8]) -> Result<Self, CastError> {
        let img = image::load_from_memory_with_format(bytes, ImageFormat::Png)
            .map_err(|e| CastError::DecodeFailed(e.to_string()))?;
        let rgba = img.to_rgba8();
        Ok(Self {
            width: rgba.width(),
            height: rgba.height(),
            data: rgba.into_raw(),
        })
    }

    /// Total byte size of the pixel buffer.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Rotate into output orientation.
    pub fn rotated(self, rotation: Rotation) -> Result<Self, CastError> {
        if rotation == Rotation::Deg0 {
            return Ok(self);
        }
        let buf: RgbaImage = ImageBuffer::from_raw(self.width, self.height, self.data)
            .ok_or_else(|| CastError::DecodeFailed("raster buffer size mismatch".into()))?;
        let rotated = match rotation {
            Rotation::Deg0 => buf,
            Rotation::Deg90 => image::imageops::rotate90(&buf),
            Rotation::Deg180 => image::imageops::rotate180(&buf),
            Rotation::Deg270 => image::imageops::rotate270(&buf),
        };
        Ok(Self {
            width: rotated.width(),
            height: rotated.height(),
            data: rotated.into_raw(),
        })
    }

    /// Extract a region as a tightly-packed RGB buffer (alpha dropped).
    ///
    /// The region must lie within the raster.
    pub fn crop_rgb(&self, x: u32, y: u32, w: u32, h: u32) -> Vec<u8> {
        let row_stride = self.width as usize * 4;
        let mut rgb = Vec::with_capacity(w as usize * h as usize * 3);
        for row in y..y + h {
            let row_start = row as usize * row_stride + x as usize * 4;
            for px in 0..w as usize {
                let offset = row_start + px * 4;
                rgb.push(self.data[offset]);
                rgb.push(self.data[offset + 1]);
                rgb.push(self.data[offset + 2]);
            }
        }
        rgb
    }
}

// ── JPEG encoding ────────────────────────────────────────────────

/// JPEG-encode a tightly-packed RGB buffer.
pub fn encode_jpeg_rgb(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, CastError> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);

    let img: RgbImage = ImageBuffer::from_raw(width, height, rgb.to_vec())
        .ok_or_else(|| CastError::EncodeFailed("invalid image dimensions".into()))?;

    img.write_with_encoder(encoder)
        .map_err(|e| CastError::EncodeFailed(e.to_string()))?;

    Ok(buf.into_inner())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn png_bytes(width: u32, height: u32, pixel: [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba(pixel));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn decode_png_roundtrip() {
        let png = png_bytes(16, 8, [10, 20, 30, 255]);
        let raster = Raster::decode_png(&png).unwrap();
        assert_eq!(raster.width, 16);
        assert_eq!(raster.height, 8);
        assert_eq!(raster.byte_len(), 16 * 8 * 4);
        assert_eq!(&raster.data[0..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(Raster::decode_png(b"not a png").is_err());
    }

    #[test]
    fn rotate90_swaps_dimensions() {
        let png = png_bytes(16, 8, [1, 2, 3, 255]);
        let raster = Raster::decode_png(&png).unwrap();
        let rotated = raster.rotated(Rotation::Deg90).unwrap();
        assert_eq!(rotated.width, 8);
        assert_eq!(rotated.height, 16);
    }

    #[test]
    fn rotate90_moves_pixels() {
        // 2×1 image: red then blue. After 90° CW it is 1×2 with red on top.
        let mut img = RgbaImage::new(2, 1);
        img.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        img.put_pixel(1, 0, Rgba([0, 0, 255, 255]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();

        let rotated = Raster::decode_png(&buf.into_inner())
            .unwrap()
            .rotated(Rotation::Deg90)
            .unwrap();
        assert_eq!(rotated.width, 1);
        assert_eq!(rotated.height, 2);
        assert_eq!(&rotated.data[0..3], &[255, 0, 0]);
        assert_eq!(&rotated.data[4..7], &[0, 0, 255]);
    }

    #[test]
    fn crop_rgb_extracts_region() {
        let png = png_bytes(8, 8, [50, 60, 70, 255]);
        let raster = Raster::decode_png(&png).unwrap();
        let rgb = raster.crop_rgb(2, 2, 4, 4);
        assert_eq!(rgb.len(), 4 * 4 * 3);
        assert_eq!(&rgb[0..3], &[50, 60, 70]);
    }

    #[test]
    fn jpeg_encode_produces_jfif() {
        let png = png_bytes(32, 32, [100, 150, 200, 255]);
        let raster = Raster::decode_png(&png).unwrap();
        let rgb = raster.crop_rgb(0, 0, 32, 32);
        let jpeg = encode_jpeg_rgb(&rgb, 32, 32, 80).unwrap();
        // SOI marker.
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);
        assert!(!jpeg.is_empty());
    }

    #[test]
    fn jpeg_encode_rejects_mismatched_dimensions() {
        let rgb = vec![0u8; 10];
        assert!(encode_jpeg_rgb(&rgb, 32, 32, 80).is_err());
    }
}
