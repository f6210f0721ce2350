//! Video frame container

use bytes::Bytes;
use std::sync::Arc;

/// Pixel layout of a frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0 (Y plane, then U, then V at quarter resolution)
    I420,
    /// Packed 8-bit RGBA
    Rgba,
}

impl PixelFormat {
    /// Expected payload size for a frame of the given dimensions
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::I420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
            PixelFormat::Rgba => w * h * 4,
        }
    }
}

/// Decoded video frame
///
/// Frames are immutable once produced. The payload is reference counted so
/// moving a frame between pipeline stages never copies pixel data.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Raw pixel data
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,
    /// Frame sequence number
    pub sequence: u64,
    /// Overlay text attached by a transform, rendered by display sinks
    pub caption: Option<Arc<str>>,
}

impl VideoFrame {
    pub fn new(
        data: Bytes,
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp_us: u64,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            format,
            timestamp_us,
            sequence,
            caption: None,
        }
    }

    /// Same pixels, different timing
    pub fn with_timing(mut self, timestamp_us: u64, sequence: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self.sequence = sequence;
        self
    }

    pub fn with_caption(mut self, caption: Arc<str>) -> Self {
        self.caption = Some(caption);
        self
    }

    /// Whether the payload length matches the declared format and dimensions
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.format.frame_size(self.width, self.height)
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
