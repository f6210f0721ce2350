//! Echo transform

use async_trait::async_trait;

use super::Transform;
use crate::error::TransformError;
use crate::video::VideoFrame;

/// Returns every frame unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

#[async_trait]
impl Transform for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn process(&self, frame: VideoFrame) -> Result<VideoFrame, TransformError> {
        Ok(frame)
    }
}
