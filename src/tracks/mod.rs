//! Track management module

pub mod bridge;
pub mod manager;
pub mod track;

pub use bridge::{BridgeConfig, BridgeStatus, TrackBridge};
pub use manager::BridgeManager;
pub use track::{EncodingParams, Track, TrackDirection, TrackId, TrackKind, TrackState, VideoCodec};
