//! Session and connection state

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::tracks::{Track, TrackId};

/// Connection lifecycle
///
/// ```text
/// Disconnected ──► Connecting ──► Connected ◄──► Reconnecting
///      ▲               │              │               │
///      └── failure ────┘              ▼               ▼
///                  Connecting ◄──── Closed ◄──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Closed)
                | (Connected, Reconnecting)
                | (Connected, Closed)
                | (Reconnecting, Connected)
                | (Reconnecting, Closed)
                | (Closed, Connecting)
        )
    }

    /// Whether a session object exists in this state
    pub fn has_session(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A participant and the tracks it published
#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub identity: String,
    pub tracks: HashMap<TrackId, Track>,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            tracks: HashMap::new(),
            joined_at: Utc::now(),
        }
    }
}

/// One joined session
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub server_address: String,
    pub local: Participant,
    pub remotes: HashMap<String, Participant>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(server_address: &str, local_identity: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_address: server_address.to_string(),
            local: Participant::new(local_identity),
            remotes: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn remote_track(&self, track_id: &TrackId) -> Option<&Track> {
        self.remotes.values().find_map(|p| p.tracks.get(track_id))
    }

    pub fn remote_track_mut(&mut self, track_id: &TrackId) -> Option<&mut Track> {
        self.remotes.values_mut().find_map(|p| p.tracks.get_mut(track_id))
    }

    pub fn info(&self, state: ConnectionState) -> SessionInfo {
        let mut remote_participants: Vec<String> = self.remotes.keys().cloned().collect();
        remote_participants.sort();
        SessionInfo {
            id: self.id,
            server_address: self.server_address.clone(),
            local_identity: self.local.identity.clone(),
            state,
            remote_participants,
            created_at: self.created_at,
        }
    }
}

/// Serializable session snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub server_address: String,
    pub local_identity: String,
    pub state: ConnectionState,
    pub remote_participants: Vec<String>,
    pub created_at: DateTime<Utc>,
}
