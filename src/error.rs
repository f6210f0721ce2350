//! Error types for the effects relay

use thiserror::Error;

use crate::session::ConnectionState;
use crate::tracks::{TrackId, TrackState};

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Track error: {0}")]
    Track(#[from] TrackError),

    #[error("Display error: {0}")]
    Display(#[from] DisplayError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session connection errors
///
/// Everything except `Aborted` is terminal for the session that raised it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Credentials rejected: {0}")]
    Rejected(String),

    #[error("Connect aborted by disconnect")]
    Aborted,

    #[error("Connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },

    #[error("Server closed the session: {0}")]
    ClosedByServer(String),
}

/// Local track publication errors (never retried automatically)
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Session is not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(#[from] CaptureError),

    #[error("Negotiation rejected: {0}")]
    NegotiationRejected(String),

    #[error("Local track not found: {0}")]
    NotFound(TrackId),
}

/// Track bridge binding errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Track {0} is not a video track")]
    NotVideo(TrackId),

    #[error("Track {id} is not active (state: {state:?})")]
    NotActive { id: TrackId, state: TrackState },

    #[error("Unknown inbound track: {0}")]
    UnknownTrack(TrackId),

    #[error("Track {0} is already bound")]
    AlreadyBound(TrackId),

    #[error("Participant {participant} already has a bridge for track {existing}")]
    ParticipantAlreadyBound { participant: String, existing: TrackId },

    #[error("Track {0} has no bridge")]
    NotBound(TrackId),

    #[error("Binding of track {0} aborted by teardown")]
    Aborted(TrackId),

    #[error("Session is not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("Subscribe failed: {0}")]
    Subscribe(TransportError),

    #[error("Publish failed: {0}")]
    Publish(TransportError),
}

/// Control channel delivery errors (never retried)
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Session is not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("Transport rejected message: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors reported by the transport boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Link is not connected")]
    NotConnected,

    #[error("Unknown track: {0}")]
    UnknownTrack(String),

    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Link closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same operation can never succeed
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_) | TransportError::Closed)
    }
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized(msg) => ConnectionError::Rejected(msg),
            TransportError::Closed => ConnectionError::ClosedByServer("link closed".into()),
            other => ConnectionError::Unreachable(other.to_string()),
        }
    }
}

/// Transform plugin errors
#[derive(Error, Debug, Clone)]
pub enum TransformError {
    #[error("Unsupported frame: {0}")]
    UnsupportedFrame(String),

    #[error("Processing failed: {0}")]
    Failed(String),
}

/// Capture device errors
#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),
}

/// Track state errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackError {
    #[error("Track {id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        id: TrackId,
        from: TrackState,
        to: TrackState,
    },
}

/// Display sink errors
#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("Track {0} is already attached to a sink")]
    AlreadyAttached(TrackId),

    #[error("Subscribe failed: {0}")]
    Subscribe(TransportError),

    #[error("Session is not connected (state: {0})")]
    NotConnected(ConnectionState),
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;
