//! Edge highlight transform
//!
//! Runs a Sobel operator over the luma plane of I420 frames and paints every
//! pixel whose gradient exceeds the threshold bright green. The current
//! prompt is attached to each output frame as its caption.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;

use super::{Transform, DEFAULT_CAPTION};
use crate::error::TransformError;
use crate::video::{PixelFormat, VideoFrame};

/// BT.601 full-green in YUV
const EDGE_Y: u8 = 150;
const EDGE_U: u8 = 44;
const EDGE_V: u8 = 21;

/// Default gradient magnitude (|gx| + |gy|) above which a pixel is an edge
pub const DEFAULT_EDGE_THRESHOLD: u32 = 200;

pub struct EdgeOverlay {
    threshold: u32,
    caption: RwLock<Arc<str>>,
}

impl EdgeOverlay {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            caption: RwLock::new(Arc::from(DEFAULT_CAPTION)),
        }
    }

    /// Caption attached to frames produced from now on
    pub fn caption(&self) -> Arc<str> {
        self.caption.read().clone()
    }

    fn highlight(data: &[u8], width: usize, height: usize, threshold: u32) -> Vec<u8> {
        let mut out = data.to_vec();
        if width < 3 || height < 3 {
            return out;
        }

        let luma = &data[..width * height];
        let chroma_width = width.div_ceil(2);
        let chroma_height = height.div_ceil(2);
        let u_offset = width * height;
        let v_offset = u_offset + chroma_width * chroma_height;
        let px = |x: usize, y: usize| luma[y * width + x] as i32;

        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let gx = (px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1))
                    - (px(x - 1, y - 1) + 2 * px(x - 1, y) + px(x - 1, y + 1));
                let gy = (px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1))
                    - (px(x - 1, y - 1) + 2 * px(x, y - 1) + px(x + 1, y - 1));

                if gx.unsigned_abs() + gy.unsigned_abs() > threshold {
                    out[y * width + x] = EDGE_Y;
                    let chroma = (y / 2) * chroma_width + x / 2;
                    out[u_offset + chroma] = EDGE_U;
                    out[v_offset + chroma] = EDGE_V;
                }
            }
        }

        out
    }
}

impl Default for EdgeOverlay {
    fn default() -> Self {
        Self::new(DEFAULT_EDGE_THRESHOLD)
    }
}

#[async_trait]
impl Transform for EdgeOverlay {
    fn name(&self) -> &str {
        "edge-overlay"
    }

    async fn process(&self, frame: VideoFrame) -> Result<VideoFrame, TransformError> {
        if frame.format != PixelFormat::I420 {
            return Err(TransformError::UnsupportedFrame(format!(
                "expected I420, got {:?}",
                frame.format
            )));
        }
        if !frame.is_well_formed() {
            return Err(TransformError::UnsupportedFrame(format!(
                "{} bytes for a {}x{} frame",
                frame.data.len(),
                frame.width,
                frame.height
            )));
        }

        let caption = self.caption();
        let threshold = self.threshold;
        let input = frame.data.clone();
        let (width, height) = (frame.width as usize, frame.height as usize);

        let pixels = tokio::task::spawn_blocking(move || {
            Self::highlight(&input, width, height, threshold)
        })
        .await
        .map_err(|e| TransformError::Failed(e.to_string()))?;

        Ok(VideoFrame {
            data: Bytes::from(pixels),
            ..frame
        }
        .with_caption(caption))
    }

    fn apply_prompt(&self, prompt: &str) {
        let prompt = prompt.trim();
        let caption = if prompt.is_empty() { DEFAULT_CAPTION } else { prompt };
        *self.caption.write() = Arc::from(caption);
        tracing::info!("Edge overlay caption set to {:?}", caption);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 8x8 I420 frame: left half black, right half white, neutral chroma
    fn step_frame() -> VideoFrame {
        let (w, h) = (8usize, 8usize);
        let mut data = vec![128u8; PixelFormat::I420.frame_size(8, 8)];
        for y in 0..h {
            for x in 0..w {
                data[y * w + x] = if x < 4 { 0 } else { 255 };
            }
        }
        VideoFrame::new(Bytes::from(data), 8, 8, PixelFormat::I420, 1_000, 1)
    }

    #[tokio::test]
    async fn test_edges_highlighted() {
        let overlay = EdgeOverlay::default();
        let out = overlay.process(step_frame()).await.unwrap();

        assert_eq!(out.resolution(), (8, 8));
        assert_eq!(out.timestamp_us, 1_000);
        assert!(out.is_well_formed());

        let row = 3 * 8;
        assert_eq!(out.data[row + 3], EDGE_Y);
        assert_eq!(out.data[row + 4], EDGE_Y);
        // Flat regions untouched
        assert_eq!(out.data[row + 1], 0);
        assert_eq!(out.data[row + 6], 255);
        // Border rows are never painted
        assert_eq!(out.data[3], 0);
    }

    #[tokio::test]
    async fn test_prompt_sets_caption() {
        let overlay = EdgeOverlay::default();
        let out = overlay.process(step_frame()).await.unwrap();
        assert_eq!(out.caption.as_deref(), Some(DEFAULT_CAPTION));

        overlay.apply_prompt("neon outlines");
        let out = overlay.process(step_frame()).await.unwrap();
        assert_eq!(out.caption.as_deref(), Some("neon outlines"));

        overlay.apply_prompt("   ");
        assert_eq!(&*overlay.caption(), DEFAULT_CAPTION);
    }

    #[tokio::test]
    async fn test_rejects_unsupported_frames() {
        let overlay = EdgeOverlay::default();

        let rgba = VideoFrame::new(Bytes::from(vec![0u8; 16]), 2, 2, PixelFormat::Rgba, 0, 0);
        assert!(matches!(
            overlay.process(rgba).await,
            Err(TransformError::UnsupportedFrame(_))
        ));

        let truncated = VideoFrame::new(Bytes::from(vec![0u8; 10]), 8, 8, PixelFormat::I420, 0, 0);
        assert!(overlay.process(truncated).await.is_err());
    }
}
