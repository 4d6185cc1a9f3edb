//! JPEG still-frame encoder.
//!
//! Serves the screenshot/diagnostic path; its quality knob is driven by the
//! adaptive quality controller rather than set directly.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::ImageEncoder;

use crate::capture::{Frame, PixelFormat};
use crate::error::StreamError;

pub struct JpegFrameEncoder {
    quality: u8,
}

impl JpegFrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn set_quality(&mut self, quality: u8) {
        self.quality = quality.clamp(1, 100);
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encode a captured frame to a JPEG image.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, StreamError> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let stride = frame.stride as usize;

        if frame.data.len() < stride * height {
            return Err(StreamError::Transient(format!(
                "frame buffer too small: {} for {}x{}",
                frame.data.len(),
                width,
                height
            )));
        }

        let (ri, bi) = match frame.format {
            PixelFormat::Bgra => (2, 0),
            PixelFormat::Rgba => (0, 2),
        };

        let mut rgb = Vec::with_capacity(width * height * 3);
        for row in 0..height {
            let src = &frame.data[row * stride..row * stride + width * 4];
            for px in src.chunks_exact(4) {
                rgb.push(px[ri]);
                rgb.push(px[1]);
                rgb.push(px[bi]);
            }
        }

        let mut jpeg = Vec::with_capacity(width * height / 4);
        let mut cursor = Cursor::new(&mut jpeg);
        JpegEncoder::new_with_quality(&mut cursor, self.quality)
            .write_image(
                &rgb,
                frame.width,
                frame.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| StreamError::Transient(format!("jpeg encode failed: {e}")))?;

        Ok(jpeg)
    }
}
