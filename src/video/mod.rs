//! Video subsystem module

pub mod buffer;
pub mod capture;
pub mod display;
pub mod frame;
pub mod scheduler;

pub use buffer::FrameQueue;
pub use capture::{CaptureDevice, TestPatternCapture};
pub use display::{DisplaySink, DisplaySinks, FrameCounterSink};
pub use frame::{PixelFormat, VideoFrame};
pub use scheduler::{FrameInput, OutputGate, Scheduler, SchedulerStats};

/// Decoded frames of one track, in arrival order
pub type FrameStream = tokio::sync::mpsc::Receiver<VideoFrame>;
