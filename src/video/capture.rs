//! Local video capture
//!
//! A capture device produces raw frames for a local publication. The relay
//! ships a synthetic test-pattern source; camera backends implement the same
//! trait outside this crate.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::constants::CAPTURE_BUFFER_FRAMES;
use crate::error::CaptureError;
use crate::tracks::EncodingParams;
use crate::video::frame::{PixelFormat, VideoFrame};
use crate::video::FrameStream;

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Device identifier, also used as the publication name
    fn id(&self) -> &str;

    /// Start producing frames at the requested resolution and rate
    async fn start(&mut self, params: &EncodingParams) -> Result<FrameStream, CaptureError>;

    async fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Moving vertical bars, I420
pub struct TestPatternCapture {
    device_id: String,

    /// Simulates an unplugged or missing device
    available: bool,

    running: Arc<AtomicBool>,

    sequence: Arc<AtomicU64>,

    frames_captured: Arc<AtomicU64>,

    task: Option<JoinHandle<()>>,
}

impl TestPatternCapture {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            available: true,
            running: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(AtomicU64::new(0)),
            frames_captured: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }

    /// A device that fails to start with `DeviceNotFound`
    pub fn unavailable(device_id: &str) -> Self {
        let mut capture = Self::new(device_id);
        capture.available = false;
        capture
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    /// Render one frame; the bar pattern shifts by 4 pixels per frame
    pub fn render(width: u32, height: u32, sequence: u64) -> Bytes {
        let (w, h) = (width as usize, height as usize);
        let mut data = vec![128u8; PixelFormat::I420.frame_size(width, height)];
        let shift = (sequence as usize * 4) % 64;

        for y in 0..h {
            let row = &mut data[y * w..(y + 1) * w];
            for (x, px) in row.iter_mut().enumerate() {
                *px = if ((x + shift) / 32) % 2 == 0 { 40 } else { 210 };
            }
        }

        Bytes::from(data)
    }
}

#[async_trait]
impl CaptureDevice for TestPatternCapture {
    fn id(&self) -> &str {
        &self.device_id
    }

    async fn start(&mut self, params: &EncodingParams) -> Result<FrameStream, CaptureError> {
        if !self.available {
            return Err(CaptureError::DeviceNotFound(self.device_id.clone()));
        }
        if self.running.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceBusy(self.device_id.clone()));
        }

        let (tx, rx) = mpsc::channel(CAPTURE_BUFFER_FRAMES);
        let running = self.running.clone();
        let sequence = self.sequence.clone();
        let frames_captured = self.frames_captured.clone();
        let (width, height) = (params.width, params.height);
        let interval = Duration::from_micros(params.frame_interval_us());
        let device_id = self.device_id.clone();

        self.sequence.store(0, Ordering::SeqCst);
        running.store(true, Ordering::SeqCst);

        self.task = Some(tokio::spawn(async move {
            let start_time = Instant::now();
            let mut ticker = tokio::time::interval(interval);

            while running.load(Ordering::Relaxed) {
                ticker.tick().await;

                let seq = sequence.fetch_add(1, Ordering::Relaxed);
                let timestamp = start_time.elapsed().as_micros() as u64;
                let frame = VideoFrame::new(
                    Self::render(width, height, seq),
                    width,
                    height,
                    PixelFormat::I420,
                    timestamp,
                    seq,
                );

                // Capture never waits on a slow consumer
                match tx.try_send(frame) {
                    Ok(()) => {
                        frames_captured.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }

            running.store(false, Ordering::SeqCst);
            tracing::debug!("Capture {} stopped", device_id);
        }));

        tracing::info!(
            "Capture {} started: {}x{} @ {} fps",
            self.device_id,
            width,
            height,
            params.frame_rate
        );

        Ok(rx)
    }

    async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for TestPatternCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
