//! In-process session server
//!
//! Routes frames, data messages and session events between participants
//! living in the same process. Every published track is auto-subscribed by
//! all other participants, the way a browser client subscribes by default.
//! Fault hooks (interrupt, failing resumes, identity-losing resumes, kicked
//! participants, rejected publishes) drive reconnect handling in tests and
//! in the demo binary.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Connection, ResumeOutcome, Transport, TransportEvent, TransportLink, TrackWriter};
use crate::constants::SUBSCRIBER_BUFFER_FRAMES;
use crate::error::TransportError;
use crate::tracks::{Track, TrackDirection, TrackId};
use crate::video::{FrameStream, VideoFrame};

/// Handle to an in-process session server
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<Hub>,
}

struct Hub {
    address: String,
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    /// token -> identity
    tokens: HashMap<String, String>,
    peers: HashMap<String, Peer>,
    tracks: HashMap<TrackId, Publication>,
    faults: Faults,
    publish_count: u64,
}

struct Peer {
    events: mpsc::UnboundedSender<TransportEvent>,
    token: String,
    interrupted: bool,
}

struct Publication {
    track: Track,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    identity: String,
    frames: mpsc::Sender<VideoFrame>,
}

#[derive(Default)]
struct Faults {
    unreachable: bool,
    failing_resumes: u32,
    resume_loses_tracks: bool,
    failing_publishes: u32,
}

impl HubState {
    fn send(&self, identity: &str, event: TransportEvent) {
        if let Some(peer) = self.peers.get(identity) {
            let _ = peer.events.send(event);
        }
    }

    fn broadcast_except(&self, identity: &str, event: &TransportEvent) {
        for (other, peer) in &self.peers {
            if other != identity {
                let _ = peer.events.send(event.clone());
            }
        }
    }

    /// Announce a publication to `identity` and mark it subscribed
    fn announce(&self, track: &Track, identity: &str) {
        let mut remote = Track::new(
            track.id.clone(),
            track.participant.clone(),
            track.name.clone(),
            track.kind,
            TrackDirection::Inbound,
        );
        remote.encoding = track.encoding.clone();

        self.send(identity, TransportEvent::TrackPublished { track: remote });
        self.send(
            identity,
            TransportEvent::TrackSubscribed {
                participant: track.participant.clone(),
                track_id: track.id.clone(),
            },
        );
    }

    fn check_connected(&self, identity: &str) -> Result<(), TransportError> {
        match self.peers.get(identity) {
            None => Err(TransportError::Closed),
            Some(peer) if peer.interrupted => Err(TransportError::NotConnected),
            Some(_) => Ok(()),
        }
    }

    /// Remove every track `identity` published; subscribers see their
    /// streams close
    fn drop_tracks_of(&mut self, identity: &str) {
        let owned: Vec<TrackId> = self
            .tracks
            .iter()
            .filter(|(_, p)| p.track.participant == identity)
            .map(|(id, _)| id.clone())
            .collect();

        for track_id in owned {
            self.tracks.remove(&track_id);
            self.broadcast_except(
                identity,
                &TransportEvent::TrackUnpublished {
                    participant: identity.to_string(),
                    track_id,
                },
            );
        }
    }

    fn drop_subscriptions_of(&mut self, identity: &str) {
        for publication in self.tracks.values_mut() {
            publication.subscribers.retain(|s| s.identity != identity);
        }
    }

    fn remove_peer(&mut self, identity: &str) -> Option<Peer> {
        let peer = self.peers.remove(identity)?;
        self.drop_tracks_of(identity);
        self.drop_subscriptions_of(identity);
        self.broadcast_except(
            identity,
            &TransportEvent::ParticipantLeft {
                identity: identity.to_string(),
            },
        );
        Some(peer)
    }
}

impl LoopbackHub {
    pub fn new(address: &str) -> Self {
        Self {
            inner: Arc::new(Hub {
                address: address.to_string(),
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.inner.clone(),
        }
    }

    /// Issue an access token that joins as `identity`
    pub fn issue_token(&self, identity: &str) -> String {
        let token = format!("lb-{}", Uuid::new_v4().simple());
        self.inner
            .state
            .lock()
            .tokens
            .insert(token.clone(), identity.to_string());
        token
    }

    /// Revoked tokens fail both new connects and resumes
    pub fn revoke_token(&self, token: &str) {
        self.inner.state.lock().tokens.remove(token);
    }

    /// Drop the network path of `identity` until it resumes
    pub fn interrupt(&self, identity: &str) -> bool {
        let mut state = self.inner.state.lock();
        let Some(peer) = state.peers.get_mut(identity) else {
            return false;
        };
        peer.interrupted = true;
        let _ = peer.events.send(TransportEvent::ConnectionInterrupted {
            reason: "network path lost".into(),
        });
        tracing::debug!("Loopback: interrupted {}", identity);
        true
    }

    /// End the session of `identity` from the server side
    pub fn kick(&self, identity: &str, reason: &str) -> bool {
        let mut state = self.inner.state.lock();
        match state.remove_peer(identity) {
            Some(peer) => {
                let _ = peer.events.send(TransportEvent::Disconnected {
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.state.lock().faults.unreachable = !reachable;
    }

    /// The next `count` resume attempts fail as unreachable
    pub fn fail_next_resumes(&self, count: u32) {
        self.inner.state.lock().faults.failing_resumes = count;
    }

    /// When false, a resume comes back with a fresh server-side identity:
    /// the participant's publications and subscriptions are gone
    pub fn set_resume_preserves_tracks(&self, preserves: bool) {
        self.inner.state.lock().faults.resume_loses_tracks = !preserves;
    }

    /// The next `count` publish attempts are rejected during negotiation
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.state.lock().faults.failing_publishes = count;
    }

    pub fn participants(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.inner.state.lock().peers.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Current publications, sorted by track id
    pub fn published_tracks(&self) -> Vec<Track> {
        let mut tracks: Vec<Track> = self
            .inner
            .state
            .lock()
            .tracks
            .values()
            .map(|p| p.track.clone())
            .collect();
        tracks.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        tracks
    }

    pub fn subscriber_count(&self, track_id: &TrackId) -> usize {
        self.inner
            .state
            .lock()
            .tracks
            .get(track_id)
            .map(|p| p.subscribers.len())
            .unwrap_or(0)
    }

    /// Total successful publishes since the hub was created
    pub fn publish_count(&self) -> u64 {
        self.inner.state.lock().publish_count
    }
}

/// Connects participants to a [`LoopbackHub`]
pub struct LoopbackTransport {
    hub: Arc<Hub>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, server_address: &str, token: &str) -> Result<Connection, TransportError> {
        let mut state = self.hub.state.lock();

        if state.faults.unreachable || server_address != self.hub.address {
            return Err(TransportError::Unreachable(server_address.to_string()));
        }
        let identity = state
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| TransportError::Unauthorized("unknown token".into()))?;
        if state.peers.contains_key(&identity) {
            return Err(TransportError::Negotiation(format!(
                "identity {} is already connected",
                identity
            )));
        }

        let (events, rx) = mpsc::unbounded_channel();
        state.broadcast_except(
            &identity,
            &TransportEvent::ParticipantJoined {
                identity: identity.clone(),
            },
        );

        let existing: Vec<String> = state.peers.keys().cloned().collect();
        state.peers.insert(
            identity.clone(),
            Peer {
                events,
                token: token.to_string(),
                interrupted: false,
            },
        );
        for other in existing {
            state.send(&identity, TransportEvent::ParticipantJoined { identity: other });
        }
        let tracks: Vec<Track> = state.tracks.values().map(|p| p.track.clone()).collect();
        for track in &tracks {
            state.announce(track, &identity);
        }

        tracing::debug!("Loopback: {} joined {}", identity, self.hub.address);

        Ok(Connection {
            link: Arc::new(LoopbackLink {
                hub: self.hub.clone(),
                identity,
            }),
            events: rx,
        })
    }
}

struct LoopbackLink {
    hub: Arc<Hub>,
    identity: String,
}

#[async_trait]
impl TransportLink for LoopbackLink {
    fn local_identity(&self) -> &str {
        &self.identity
    }

    async fn subscribe(&self, track_id: &TrackId) -> Result<FrameStream, TransportError> {
        let mut state = self.hub.state.lock();
        state.check_connected(&self.identity)?;

        let publication = state
            .tracks
            .get_mut(track_id)
            .ok_or_else(|| TransportError::UnknownTrack(track_id.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_FRAMES);
        publication.subscribers.push(Subscriber {
            identity: self.identity.clone(),
            frames: tx,
        });
        Ok(rx)
    }

    async fn publish(&self, track: &Track) -> Result<Arc<dyn TrackWriter>, TransportError> {
        let mut state = self.hub.state.lock();
        state.check_connected(&self.identity)?;

        if state.faults.failing_publishes > 0 {
            state.faults.failing_publishes -= 1;
            return Err(TransportError::Negotiation("publication rejected".into()));
        }
        if state.tracks.contains_key(&track.id) {
            return Err(TransportError::Negotiation(format!(
                "track id {} is already published",
                track.id
            )));
        }

        let mut published = track.clone();
        published.participant = self.identity.clone();
        state.publish_count += 1;

        let others: Vec<String> = state
            .peers
            .keys()
            .filter(|identity| **identity != self.identity)
            .cloned()
            .collect();
        for other in &others {
            state.announce(&published, other);
        }

        state.tracks.insert(
            track.id.clone(),
            Publication {
                track: published,
                subscribers: Vec::new(),
            },
        );

        Ok(Arc::new(LoopbackWriter {
            hub: self.hub.clone(),
            owner: self.identity.clone(),
            track_id: track.id.clone(),
        }))
    }

    async fn unpublish(&self, track_id: &TrackId) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        let owned = state
            .tracks
            .get(track_id)
            .is_some_and(|p| p.track.participant == self.identity);
        if !owned {
            return Err(TransportError::UnknownTrack(track_id.to_string()));
        }

        state.tracks.remove(track_id);
        state.broadcast_except(
            &self.identity,
            &TransportEvent::TrackUnpublished {
                participant: self.identity.clone(),
                track_id: track_id.clone(),
            },
        );
        Ok(())
    }

    async fn send_data(&self, destination: &str, payload: Bytes) -> Result<(), TransportError> {
        let state = self.hub.state.lock();
        state.check_connected(&self.identity)?;

        if !state.peers.contains_key(destination) {
            return Err(TransportError::UnknownParticipant(destination.to_string()));
        }
        state.send(
            destination,
            TransportEvent::DataReceived {
                sender: self.identity.clone(),
                payload,
            },
        );
        Ok(())
    }

    async fn resume(&self) -> Result<ResumeOutcome, TransportError> {
        let mut state = self.hub.state.lock();

        let token = match state.peers.get(&self.identity) {
            Some(peer) => peer.token.clone(),
            None => return Err(TransportError::Closed),
        };
        if !state.tokens.contains_key(&token) {
            return Err(TransportError::Unauthorized("token revoked".into()));
        }
        if state.faults.unreachable {
            return Err(TransportError::Unreachable(self.hub.address.clone()));
        }
        if state.faults.failing_resumes > 0 {
            state.faults.failing_resumes -= 1;
            return Err(TransportError::Unreachable("resume failed".into()));
        }

        if let Some(peer) = state.peers.get_mut(&self.identity) {
            peer.interrupted = false;
        }

        if !state.faults.resume_loses_tracks {
            return Ok(ResumeOutcome {
                tracks_preserved: true,
            });
        }

        state.drop_tracks_of(&self.identity);
        state.drop_subscriptions_of(&self.identity);
        let remote: Vec<Track> = state.tracks.values().map(|p| p.track.clone()).collect();
        for track in &remote {
            state.announce(track, &self.identity);
        }

        Ok(ResumeOutcome {
            tracks_preserved: false,
        })
    }

    async fn close(&self) {
        let mut state = self.hub.state.lock();
        if state.remove_peer(&self.identity).is_some() {
            tracing::debug!("Loopback: {} left", self.identity);
        }
    }
}

struct LoopbackWriter {
    hub: Arc<Hub>,
    owner: String,
    track_id: TrackId,
}

#[async_trait]
impl TrackWriter for LoopbackWriter {
    async fn write_frame(&self, frame: VideoFrame) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();
        state.check_connected(&self.owner)?;

        let publication = state.tracks.get_mut(&self.track_id).ok_or(TransportError::Closed)?;

        // A subscriber that cannot keep up misses frames
        publication
            .subscribers
            .retain(|subscriber| match subscriber.frames.try_send(frame.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::TrackKind;
    use crate::video::PixelFormat;

    const ADDRESS: &str = "loopback://test";

    async fn join(hub: &LoopbackHub, identity: &str) -> Connection {
        let token = hub.issue_token(identity);
        hub.transport().connect(ADDRESS, &token).await.unwrap()
    }

    fn camera(id: &str) -> Track {
        Track::new(TrackId::new(id), "", "camera", TrackKind::Video, TrackDirection::Outbound)
    }

    fn frame(ts: u64) -> VideoFrame {
        VideoFrame::new(Bytes::new(), 2, 2, PixelFormat::I420, ts, ts)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_connect_rejections() {
        let hub = LoopbackHub::new(ADDRESS);
        let transport = hub.transport();

        assert!(matches!(
            transport.connect(ADDRESS, "forged").await,
            Err(TransportError::Unauthorized(_))
        ));

        let token = hub.issue_token("worker");
        assert!(matches!(
            transport.connect("loopback://elsewhere", &token).await,
            Err(TransportError::Unreachable(_))
        ));

        hub.set_reachable(false);
        assert!(transport.connect(ADDRESS, &token).await.is_err());
        hub.set_reachable(true);
        assert!(transport.connect(ADDRESS, &token).await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_is_announced_and_forwarded() {
        let hub = LoopbackHub::new(ADDRESS);
        let mut worker = join(&hub, "worker").await;
        let browser = join(&hub, "browser").await;

        let writer = browser.link.publish(&camera("TR_cam")).await.unwrap();

        let events = drain(&mut worker.events);
        assert!(matches!(&events[0], TransportEvent::ParticipantJoined { identity } if identity == "browser"));
        match &events[1] {
            TransportEvent::TrackPublished { track } => {
                assert_eq!(track.participant, "browser");
                assert_eq!(track.direction, TrackDirection::Inbound);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(&events[2], TransportEvent::TrackSubscribed { track_id, .. } if track_id.as_str() == "TR_cam"));

        let mut frames = worker.link.subscribe(&TrackId::new("TR_cam")).await.unwrap();
        writer.write_frame(frame(1)).await.unwrap();
        writer.write_frame(frame(2)).await.unwrap();
        assert_eq!(frames.recv().await.unwrap().timestamp_us, 1);
        assert_eq!(frames.recv().await.unwrap().timestamp_us, 2);
    }

    #[tokio::test]
    async fn test_late_joiner_sees_existing_tracks() {
        let hub = LoopbackHub::new(ADDRESS);
        let browser = join(&hub, "browser").await;
        browser.link.publish(&camera("TR_cam")).await.unwrap();

        let mut worker = join(&hub, "worker").await;
        let events = drain(&mut worker.events);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], TransportEvent::TrackSubscribed { .. }));
    }

    #[tokio::test]
    async fn test_data_is_ordered() {
        let hub = LoopbackHub::new(ADDRESS);
        let mut worker = join(&hub, "worker").await;
        let browser = join(&hub, "browser").await;
        drain(&mut worker.events);

        for i in 0..5 {
            browser
                .link
                .send_data("worker", Bytes::from(format!("m{}", i)))
                .await
                .unwrap();
        }

        let payloads: Vec<Bytes> = drain(&mut worker.events)
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::DataReceived { sender, payload } if sender == "browser" => Some(payload),
                _ => None,
            })
            .collect();
        let expected: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("m{}", i))).collect();
        assert_eq!(payloads, expected);

        assert!(matches!(
            browser.link.send_data("nobody", Bytes::new()).await,
            Err(TransportError::UnknownParticipant(_))
        ));
    }

    #[tokio::test]
    async fn test_interrupt_and_resume() {
        let hub = LoopbackHub::new(ADDRESS);
        let mut worker = join(&hub, "worker").await;
        let writer = worker.link.publish(&camera("TR_out")).await.unwrap();

        assert!(hub.interrupt("worker"));
        assert!(matches!(
            drain(&mut worker.events).last(),
            Some(TransportEvent::ConnectionInterrupted { .. })
        ));
        assert_eq!(writer.write_frame(frame(1)).await, Err(TransportError::NotConnected));

        hub.fail_next_resumes(2);
        assert!(worker.link.resume().await.is_err());
        assert!(worker.link.resume().await.is_err());
        let outcome = worker.link.resume().await.unwrap();
        assert!(outcome.tracks_preserved);
        assert!(writer.write_frame(frame(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_resume_losing_identity_reannounces() {
        let hub = LoopbackHub::new(ADDRESS);
        let mut worker = join(&hub, "worker").await;
        let mut browser = join(&hub, "browser").await;
        browser.link.publish(&camera("TR_cam")).await.unwrap();
        worker.link.publish(&camera("TR_out")).await.unwrap();
        let mut frames = worker.link.subscribe(&TrackId::new("TR_cam")).await.unwrap();
        drain(&mut worker.events);
        drain(&mut browser.events);

        hub.set_resume_preserves_tracks(false);
        hub.interrupt("worker");
        let outcome = worker.link.resume().await.unwrap();
        assert!(!outcome.tracks_preserved);

        // Old subscription is gone, the remote camera is announced again
        assert!(frames.recv().await.is_none());
        let events = drain(&mut worker.events);
        assert!(events
            .iter()
            .any(|e| matches!(e, TransportEvent::TrackSubscribed { track_id, .. } if track_id.as_str() == "TR_cam")));

        // Our own publication was withdrawn
        assert!(drain(&mut browser.events)
            .iter()
            .any(|e| matches!(e, TransportEvent::TrackUnpublished { track_id, .. } if track_id.as_str() == "TR_out")));
        assert_eq!(hub.published_tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_revoked_token_is_fatal_on_resume() {
        let hub = LoopbackHub::new(ADDRESS);
        let token = hub.issue_token("worker");
        let worker = hub.transport().connect(ADDRESS, &token).await.unwrap();

        hub.revoke_token(&token);
        hub.interrupt("worker");
        let err = worker.link.resume().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_close_and_kick() {
        let hub = LoopbackHub::new(ADDRESS);
        let mut worker = join(&hub, "worker").await;
        let browser = join(&hub, "browser").await;
        browser.link.publish(&camera("TR_cam")).await.unwrap();
        let mut frames = worker.link.subscribe(&TrackId::new("TR_cam")).await.unwrap();
        drain(&mut worker.events);

        browser.link.close().await;
        assert!(frames.recv().await.is_none());
        let events = drain(&mut worker.events);
        assert!(matches!(&events[0], TransportEvent::TrackUnpublished { .. }));
        assert!(matches!(&events[1], TransportEvent::ParticipantLeft { identity } if identity == "browser"));

        assert!(hub.kick("worker", "room closed"));
        assert!(matches!(
            drain(&mut worker.events).last(),
            Some(TransportEvent::Disconnected { .. })
        ));
        assert!(hub.participants().is_empty());
        assert_eq!(worker.link.resume().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_publish_faults() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = join(&hub, "worker").await;

        hub.fail_next_publishes(1);
        assert!(matches!(
            worker.link.publish(&camera("TR_a")).await,
            Err(TransportError::Negotiation(_))
        ));
        worker.link.publish(&camera("TR_a")).await.unwrap();
        assert!(worker.link.publish(&camera("TR_a")).await.is_err());
        assert_eq!(hub.publish_count(), 1);

        worker.link.unpublish(&TrackId::new("TR_a")).await.unwrap();
        assert!(hub.published_tracks().is_empty());
    }
}
