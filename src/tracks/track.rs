//! Track identity, encoding parameters and lifecycle state

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TrackError;

/// Transport-assigned track identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackDirection {
    Inbound,
    Outbound,
}

/// Video codec negotiated for an outbound publication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Vp8,
    Vp9,
    H264,
    #[default]
    Av1,
}

/// Encoding parameters requested for a track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingParams {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    pub frame_rate: u32,
    pub simulcast: bool,
}

impl Default for EncodingParams {
    fn default() -> Self {
        Self {
            codec: VideoCodec::Av1,
            width: 1280,
            height: 720,
            bitrate: 2_500_000,
            frame_rate: 30,
            simulcast: false,
        }
    }
}

impl EncodingParams {
    /// Frame interval at the target frame rate, in microseconds
    pub fn frame_interval_us(&self) -> u64 {
        1_000_000 / self.frame_rate.max(1) as u64
    }
}

/// Track lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Pending,
    Active,
    Ended,
}

impl TrackState {
    pub fn can_transition_to(self, next: TrackState) -> bool {
        match (self, next) {
            (TrackState::Pending, TrackState::Active) => true,
            (TrackState::Pending, TrackState::Ended) => true,
            (TrackState::Active, TrackState::Ended) => true,
            (TrackState::Pending, TrackState::Pending)
            | (TrackState::Active, TrackState::Pending)
            | (TrackState::Active, TrackState::Active)
            | (TrackState::Ended, _) => false,
        }
    }
}

/// A single audio or video stream within a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    /// Identity of the participant that published the track
    pub participant: String,
    pub name: String,
    pub kind: TrackKind,
    pub direction: TrackDirection,
    pub encoding: Option<EncodingParams>,
    state: TrackState,
}

impl Track {
    pub fn new(
        id: TrackId,
        participant: impl Into<String>,
        name: impl Into<String>,
        kind: TrackKind,
        direction: TrackDirection,
    ) -> Self {
        Self {
            id,
            participant: participant.into(),
            name: name.into(),
            kind,
            direction,
            encoding: None,
            state: TrackState::Pending,
        }
    }

    pub fn with_encoding(mut self, encoding: EncodingParams) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    pub fn is_active(&self) -> bool {
        self.state == TrackState::Active
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: TrackState) -> Result<TrackState, TrackError> {
        if !self.state.can_transition_to(next) {
            return Err(TrackError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }
}
