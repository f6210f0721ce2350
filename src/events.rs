//! Relay event bus
//!
//! Every lifecycle change the session goes through is published here so
//! that the web UI, binaries and tests can observe the pipeline without
//! registering callbacks on its internals.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::session::ConnectionState;
use crate::tracks::{TrackId, TrackKind};

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ParticipantJoined {
        identity: String,
    },
    ParticipantLeft {
        identity: String,
    },
    TrackAvailable {
        participant: String,
        track_id: TrackId,
        kind: TrackKind,
    },
    TrackEnded {
        participant: String,
        track_id: TrackId,
    },
    LocalTrackPublished {
        track_id: TrackId,
    },
    LocalTrackUnpublished {
        track_id: TrackId,
    },
    BridgeBound {
        inbound: TrackId,
        outbound: TrackId,
    },
    BridgeUnbound {
        inbound: TrackId,
        outbound: TrackId,
    },
    /// Consecutive processing timeouts reached the configured streak
    DegradedProcessing {
        track_id: TrackId,
        consecutive_timeouts: u32,
    },
    ProcessingRecovered {
        track_id: TrackId,
    },
    ReconnectAttempt {
        attempt: u32,
        delay_ms: u64,
    },
    /// Reconnect gave up; the session is closed
    ConnectionLost {
        attempts: u32,
    },
    /// Server ended the session or rejected credentials during resume
    ConnectionClosed {
        reason: String,
    },
}

/// Broadcast channel for relay events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Events published with no subscriber are dropped.
    pub fn publish(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    /// Receive all future events
    ///
    /// A subscriber that falls more than the channel capacity behind gets a
    /// `Lagged` error and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(RelayEvent::ParticipantJoined {
            identity: "browser".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            RelayEvent::ParticipantJoined {
                identity: "browser".into()
            }
        );
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(RelayEvent::ConnectionLost { attempts: 3 });
    }

    #[test]
    fn test_event_json_shape() {
        let event = RelayEvent::DegradedProcessing {
            track_id: TrackId::new("TR_1"),
            consecutive_timeouts: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "degraded_processing");
        assert_eq!(json["track_id"], "TR_1");
        assert_eq!(json["consecutive_timeouts"], 5);
    }
}
