//! Transport boundary
//!
//! The SFU, ICE negotiation and packet recovery live outside this crate. The
//! relay only needs a link that can subscribe to decoded frame streams,
//! publish raw frames, deliver reliable data messages and report session
//! events. [`loopback`] provides an in-process implementation.

pub mod loopback;

pub use loopback::{LoopbackHub, LoopbackTransport};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::tracks::{Track, TrackId};
use crate::video::{FrameStream, VideoFrame};

/// Session events reported by the transport, in delivery order
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ParticipantJoined {
        identity: String,
    },
    ParticipantLeft {
        identity: String,
    },
    /// A remote track was announced (not yet flowing)
    TrackPublished {
        track: Track,
    },
    /// Frames of a remote track can now be subscribed to
    TrackSubscribed {
        participant: String,
        track_id: TrackId,
    },
    TrackUnpublished {
        participant: String,
        track_id: TrackId,
    },
    /// Reliable, ordered data message addressed to this participant
    DataReceived {
        sender: String,
        payload: Bytes,
    },
    /// Transient loss; the link can be resumed
    ConnectionInterrupted {
        reason: String,
    },
    /// The server ended the session; the link cannot be resumed
    Disconnected {
        reason: String,
    },
}

/// Result of a successful resume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeOutcome {
    /// Whether published and subscribed tracks survived the interruption
    pub tracks_preserved: bool,
}

/// Write side of an outbound publication
#[async_trait]
pub trait TrackWriter: Send + Sync {
    async fn write_frame(&self, frame: VideoFrame) -> Result<(), TransportError>;
}

/// An established connection to the session server
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Identity the server assigned to this participant
    fn local_identity(&self) -> &str;

    async fn subscribe(&self, track_id: &TrackId) -> Result<FrameStream, TransportError>;

    async fn publish(&self, track: &Track) -> Result<Arc<dyn TrackWriter>, TransportError>;

    async fn unpublish(&self, track_id: &TrackId) -> Result<(), TransportError>;

    /// Reliable, ordered delivery to one participant
    async fn send_data(&self, destination: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Try to re-establish the link after `ConnectionInterrupted`
    async fn resume(&self) -> Result<ResumeOutcome, TransportError>;

    async fn close(&self);
}

/// A fresh link plus its event stream
pub struct Connection {
    pub link: Arc<dyn TransportLink>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, server_address: &str, token: &str) -> Result<Connection, TransportError>;
}
