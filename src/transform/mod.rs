//! Per-frame transform plugins
//!
//! A transform sees one frame at a time and knows nothing about sessions or
//! transport. The scheduler enforces the latency contract around it.

pub mod edges;
pub mod passthrough;

pub use edges::EdgeOverlay;
pub use passthrough::Passthrough;

use async_trait::async_trait;

use crate::error::TransformError;
use crate::video::VideoFrame;

/// Caption used until a prompt arrives, and for prompts without text
pub const DEFAULT_CAPTION: &str = "Processed Feed";

#[async_trait]
pub trait Transform: Send + Sync {
    /// Short name used in logs and status output
    fn name(&self) -> &str;

    /// Produce the output frame for `frame`
    ///
    /// May be abandoned by the scheduler at any await point once the
    /// processing deadline passes.
    async fn process(&self, frame: VideoFrame) -> Result<VideoFrame, TransformError>;

    /// Update parameters from a control-plane prompt
    fn apply_prompt(&self, _prompt: &str) {}
}
