//! Session manager
//!
//! Owns the connection to the session server and everything hanging off it:
//! the participant roster, local publications and the bridge table. Transport
//! events are applied by a single event-loop task, which also runs observer
//! callbacks and the reconnect procedure, so callbacks never race each other.
//!
//! ```text
//!   Transport ──events──► event loop ──► Session (roster, tracks)
//!                              │  ├──► observers (track available / ended,
//!                              │  │     participants, control messages)
//!                              │  └──► EventBus
//!                              ▼
//!                    reconnect: pause bridges ─► resume() with backoff
//!                               ─► resume or rebuild bridges
//! ```

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::observer::{Registry, Subscription};
use super::state::{ConnectionState, Participant, Session, SessionInfo};
use crate::config::AppConfig;
use crate::constants::OUTBOUND_TRACK_NAME;
use crate::control::{ControlChannel, ReceivedMessage};
use crate::error::{BridgeError, ConnectionError, PublishError, TransportError};
use crate::events::{EventBus, RelayEvent};
use crate::tracks::{
    BridgeConfig, BridgeManager, BridgeStatus, EncodingParams, Track, TrackDirection, TrackId,
    TrackKind, TrackState,
};
use crate::transform::Transform;
use crate::transport::{Connection, TrackWriter, Transport, TransportEvent, TransportLink};
use crate::video::{CaptureDevice, FrameStream};

/// Entry point for joining a session and managing its media
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: AppConfig,
    bridge_config: BridgeConfig,
    state: watch::Sender<ConnectionState>,
    session: RwLock<Option<Session>>,
    link: RwLock<Option<Arc<dyn TransportLink>>>,
    bridges: BridgeManager,
    local_tracks: DashMap<TrackId, LocalPublication>,
    observers: Observers,
    events: EventBus,
    terminal_error: Mutex<Option<ConnectionError>>,
    /// Serializes `connect` calls
    connect_lock: tokio::sync::Mutex<()>,
    /// Cancels the in-progress connect or the running event loop
    lifecycle: Mutex<Option<CancellationToken>>,
}

struct Observers {
    track_available: Arc<Registry<Track>>,
    track_ended: Arc<Registry<Track>>,
    participant_joined: Arc<Registry<String>>,
    participant_left: Arc<Registry<String>>,
    messages: Arc<Registry<ReceivedMessage>>,
}

/// Writer slot of a local publication; swapped when a reconnect republishes
type WriterSlot = Arc<RwLock<Arc<dyn TrackWriter>>>;

struct LocalPublication {
    track: Track,
    device: Box<dyn CaptureDevice>,
    writer: WriterSlot,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

impl LocalPublication {
    async fn stop(mut self) {
        self.cancel.cancel();
        let _ = self.pump.await;
        self.device.stop().await;
    }
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, config: AppConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let bridge_config = BridgeConfig {
            scheduler: config.scheduler.clone(),
            outbound: config.publish.clone(),
            outbound_name: OUTBOUND_TRACK_NAME.to_string(),
        };

        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                bridge_config,
                state,
                session: RwLock::new(None),
                link: RwLock::new(None),
                bridges: BridgeManager::new(),
                local_tracks: DashMap::new(),
                observers: Observers {
                    track_available: Registry::new(),
                    track_ended: Registry::new(),
                    participant_joined: Registry::new(),
                    participant_left: Registry::new(),
                    messages: Registry::new(),
                },
                events: EventBus::new(),
                terminal_error: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Connect using the address and token from the configuration
    pub async fn connect_configured(&self) -> Result<SessionInfo, ConnectionError> {
        let session = &self.inner.config.session;
        self.connect(&session.server_address, &session.token).await
    }

    /// Join the session at `server_address`
    ///
    /// Idempotent: while a session exists, the existing session is returned.
    /// Concurrent calls are serialized. A `disconnect` issued while
    /// connecting aborts the attempt with [`ConnectionError::Aborted`].
    pub async fn connect(&self, server_address: &str, token: &str) -> Result<SessionInfo, ConnectionError> {
        let inner = &self.inner;
        let _serial = inner.connect_lock.lock().await;

        if self.state().has_session() {
            if let Some(info) = self.session_info() {
                tracing::debug!("Already connected to {}", info.server_address);
                return Ok(info);
            }
        }

        let cancel = CancellationToken::new();
        *inner.lifecycle.lock() = Some(cancel.clone());
        *inner.terminal_error.lock() = None;
        inner.transition(ConnectionState::Connecting);
        tracing::info!("Connecting to {}", server_address);

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = inner.transport.connect(server_address, token) => Some(result),
        };

        let Connection { link, events } = match connected {
            None => {
                tracing::info!("Connect to {} aborted", server_address);
                inner.transition(ConnectionState::Closed);
                return Err(ConnectionError::Aborted);
            }
            Some(Err(e)) => {
                tracing::warn!("Failed to connect to {}: {}", server_address, e);
                inner.transition(ConnectionState::Disconnected);
                return Err(e.into());
            }
            Some(Ok(connection)) => connection,
        };

        if cancel.is_cancelled() {
            link.close().await;
            inner.transition(ConnectionState::Closed);
            return Err(ConnectionError::Aborted);
        }

        let session = Session::new(server_address, link.local_identity());
        let info = session.info(ConnectionState::Connected);
        *inner.session.write() = Some(session);
        *inner.link.write() = Some(link.clone());

        if !inner.transition(ConnectionState::Connected) {
            // Disconnected between the handshake and here
            inner.link.write().take();
            inner.session.write().take();
            link.close().await;
            return Err(ConnectionError::Aborted);
        }

        tracing::info!(
            "Joined session {} as {}",
            info.id,
            info.local_identity
        );
        tokio::spawn(Inner::run_event_loop(inner.clone(), link, events, cancel));
        Ok(info)
    }

    /// Leave the session and release everything attached to it
    ///
    /// Safe in every state, including while connecting or reconnecting, and
    /// when called repeatedly.
    pub async fn disconnect(&self) {
        let lifecycle = self.inner.lifecycle.lock().take();
        if let Some(token) = lifecycle {
            token.cancel();
        }

        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Closed => {
                tracing::debug!("Disconnect: no active session");
            }
            state => {
                tracing::info!("Disconnecting (state: {})", state);
                self.inner.teardown().await;
                self.inner.transition(ConnectionState::Closed);
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Why the last session ended, if it ended on its own
    pub fn terminal_error(&self) -> Option<ConnectionError> {
        self.inner.terminal_error.lock().clone()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        let state = self.state();
        self.inner.session.read().as_ref().map(|s| s.info(state))
    }

    pub fn local_identity(&self) -> Option<String> {
        self.inner
            .session
            .read()
            .as_ref()
            .map(|s| s.local.identity.clone())
    }

    /// Remote participant identities, sorted
    pub fn remote_participants(&self) -> Vec<String> {
        self.inner
            .session
            .read()
            .as_ref()
            .map(|s| {
                let mut identities: Vec<String> = s.remotes.keys().cloned().collect();
                identities.sort();
                identities
            })
            .unwrap_or_default()
    }

    /// Every known remote track, sorted by id
    pub fn remote_tracks(&self) -> Vec<Track> {
        let mut tracks: Vec<Track> = self
            .inner
            .session
            .read()
            .as_ref()
            .map(|s| s.remotes.values().flat_map(|p| p.tracks.values().cloned()).collect())
            .unwrap_or_default();
        tracks.sort_by(|a, b| a.id.cmp(&b.id));
        tracks
    }

    pub fn local_tracks(&self) -> Vec<Track> {
        let mut tracks: Vec<Track> = self
            .inner
            .local_tracks
            .iter()
            .map(|entry| entry.track.clone())
            .collect();
        tracks.sort_by(|a, b| a.id.cmp(&b.id));
        tracks
    }

    pub fn control(&self) -> ControlChannel {
        ControlChannel::new(self.clone())
    }

    pub(crate) fn link(&self) -> Option<Arc<dyn TransportLink>> {
        self.inner.link.read().clone()
    }

    pub(crate) fn message_observers(&self) -> &Arc<Registry<ReceivedMessage>> {
        &self.inner.observers.messages
    }

    /// Called with each remote track once it becomes active
    pub fn on_remote_track_available(&self, callback: impl Fn(&Track) + Send + Sync + 'static) -> Subscription {
        self.inner.observers.track_available.register(callback)
    }

    /// Called with each active remote track once it ends
    pub fn on_remote_track_ended(&self, callback: impl Fn(&Track) + Send + Sync + 'static) -> Subscription {
        self.inner.observers.track_ended.register(callback)
    }

    pub fn on_participant_joined(&self, callback: impl Fn(&String) + Send + Sync + 'static) -> Subscription {
        self.inner.observers.participant_joined.register(callback)
    }

    pub fn on_participant_left(&self, callback: impl Fn(&String) + Send + Sync + 'static) -> Subscription {
        self.inner.observers.participant_left.register(callback)
    }

    /// Subscribe to the decoded frames of a remote track
    pub async fn subscribe(&self, track_id: &TrackId) -> Result<FrameStream, TransportError> {
        let link = self.link().ok_or(TransportError::NotConnected)?;
        link.subscribe(track_id).await
    }

    /// Start capturing from `device` and publish it as a new local track
    ///
    /// Failures are reported, never retried.
    pub async fn publish_local_track(
        &self,
        mut device: Box<dyn CaptureDevice>,
        params: EncodingParams,
    ) -> Result<Track, PublishError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(PublishError::NotConnected(state));
        }
        let link = self.link().ok_or(PublishError::NotConnected(state))?;

        let frames = device.start(&params).await?;

        let mut track = Track::new(
            TrackId::new(format!("TR_{}", Uuid::new_v4().simple())),
            link.local_identity(),
            device.id(),
            TrackKind::Video,
            TrackDirection::Outbound,
        )
        .with_encoding(params);

        let writer = match link.publish(&track).await {
            Ok(writer) => writer,
            Err(e) => {
                device.stop().await;
                tracing::warn!("Publication of {} rejected: {}", device.id(), e);
                return Err(PublishError::NegotiationRejected(e.to_string()));
            }
        };
        let _ = track.transition(TrackState::Active);

        let writer: WriterSlot = Arc::new(RwLock::new(writer));
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_local_frames(
            self.state_watch(),
            frames,
            writer.clone(),
            cancel.clone(),
            track.id.clone(),
        ));

        if let Some(session) = self.inner.session.write().as_mut() {
            session.local.tracks.insert(track.id.clone(), track.clone());
        }
        self.inner.local_tracks.insert(
            track.id.clone(),
            LocalPublication {
                track: track.clone(),
                device,
                writer,
                cancel,
                pump,
            },
        );

        tracing::info!("Published local track {} ({})", track.id, track.name);
        self.inner.events.publish(RelayEvent::LocalTrackPublished {
            track_id: track.id.clone(),
        });
        Ok(track)
    }

    /// Stop capturing and withdraw a local publication
    pub async fn unpublish_local_track(&self, track_id: &TrackId) -> Result<(), PublishError> {
        let (_, publication) = self
            .inner
            .local_tracks
            .remove(track_id)
            .ok_or_else(|| PublishError::NotFound(track_id.clone()))?;
        publication.stop().await;

        if let Some(link) = self.link() {
            if let Err(e) = link.unpublish(track_id).await {
                tracing::debug!("Unpublish of {} failed: {}", track_id, e);
            }
        }
        if let Some(session) = self.inner.session.write().as_mut() {
            session.local.tracks.remove(track_id);
        }

        tracing::info!("Unpublished local track {}", track_id);
        self.inner.events.publish(RelayEvent::LocalTrackUnpublished {
            track_id: track_id.clone(),
        });
        Ok(())
    }

    /// Route an active remote video track through `transform` into a new
    /// outbound publication
    pub async fn bind_bridge(
        &self,
        track_id: &TrackId,
        transform: Arc<dyn Transform>,
    ) -> Result<BridgeStatus, BridgeError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(BridgeError::NotConnected(state));
        }
        let link = self.link().ok_or(BridgeError::NotConnected(state))?;
        let track = self
            .inner
            .session
            .read()
            .as_ref()
            .and_then(|s| s.remote_track(track_id).cloned())
            .ok_or_else(|| BridgeError::UnknownTrack(track_id.clone()))?;

        self.inner
            .bridges
            .bind(
                link,
                &track,
                transform,
                &self.inner.bridge_config,
                self.inner.events.clone(),
            )
            .await
    }

    pub async fn unbind_bridge(&self, track_id: &TrackId) -> Result<BridgeStatus, BridgeError> {
        self.inner.bridges.unbind(track_id).await
    }

    pub fn bridges(&self) -> Vec<BridgeStatus> {
        self.inner.bridges.get_all_statuses()
    }

    pub fn bridge_count(&self) -> usize {
        self.inner.bridges.bridge_count()
    }
}

impl Inner {
    /// Apply a state change; returns false when it is not a legal move
    fn transition(&self, next: ConnectionState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                tracing::warn!("Ignoring state change {} -> {}", current, next);
                return false;
            }
            from = Some(*current);
            *current = next;
            true
        });

        match from {
            Some(from) => {
                tracing::info!("Session state: {} -> {}", from, next);
                self.events.publish(RelayEvent::StateChanged { from, to: next });
                true
            }
            None => *self.state.borrow() == next,
        }
    }

    async fn run_event_loop(
        self: Arc<Self>,
        link: Arc<dyn TransportLink>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            let Some(event) = event else {
                tracing::warn!("Transport event stream ended");
                self.close_session(ConnectionError::ClosedByServer("event stream ended".into()))
                    .await;
                break;
            };

            match event {
                TransportEvent::ConnectionInterrupted { reason } => {
                    tracing::warn!("Connection interrupted: {}", reason);
                    if !self.reconnect(&link, &cancel).await {
                        break;
                    }
                }
                TransportEvent::Disconnected { reason } => {
                    tracing::warn!("Server closed the session: {}", reason);
                    self.events.publish(RelayEvent::ConnectionClosed {
                        reason: reason.clone(),
                    });
                    self.close_session(ConnectionError::ClosedByServer(reason)).await;
                    break;
                }
                other => self.apply(other),
            }
        }

        tracing::debug!("Session event loop exited");
    }

    /// Update the roster and notify observers
    fn apply(&self, event: TransportEvent) {
        match event {
            TransportEvent::ParticipantJoined { identity } => {
                let added = match self.session.write().as_mut() {
                    Some(session) if !session.remotes.contains_key(&identity) => {
                        session
                            .remotes
                            .insert(identity.clone(), Participant::new(&identity));
                        true
                    }
                    _ => false,
                };
                if added {
                    tracing::info!("Participant joined: {}", identity);
                    self.events.publish(RelayEvent::ParticipantJoined {
                        identity: identity.clone(),
                    });
                    self.observers.participant_joined.notify(&identity);
                }
            }
            TransportEvent::ParticipantLeft { identity } => {
                let removed = self
                    .session
                    .write()
                    .as_mut()
                    .and_then(|s| s.remotes.remove(&identity));
                if let Some(participant) = removed {
                    for mut track in participant.tracks.into_values() {
                        if track.is_active() && track.transition(TrackState::Ended).is_ok() {
                            self.track_ended(&track);
                        }
                    }
                    tracing::info!("Participant left: {}", identity);
                    self.events.publish(RelayEvent::ParticipantLeft {
                        identity: identity.clone(),
                    });
                    self.observers.participant_left.notify(&identity);
                }
            }
            TransportEvent::TrackPublished { track } => {
                let mut guard = self.session.write();
                let Some(session) = guard.as_mut() else {
                    return;
                };
                let participant = session
                    .remotes
                    .entry(track.participant.clone())
                    .or_insert_with(|| Participant::new(&track.participant));
                if participant.tracks.contains_key(&track.id) {
                    tracing::debug!("Track {} already announced", track.id);
                } else {
                    tracing::debug!("Remote {:?} track {} announced by {}", track.kind, track.id, track.participant);
                    participant.tracks.insert(track.id.clone(), track);
                }
            }
            TransportEvent::TrackSubscribed { track_id, .. } => {
                let activated = self
                    .session
                    .write()
                    .as_mut()
                    .and_then(|s| s.remote_track_mut(&track_id))
                    .and_then(|track| match track.transition(TrackState::Active) {
                        Ok(_) => Some(track.clone()),
                        Err(e) => {
                            tracing::debug!("{}", e);
                            None
                        }
                    });

                if let Some(track) = activated {
                    tracing::info!(
                        "Remote {:?} track {} from {} available",
                        track.kind,
                        track.id,
                        track.participant
                    );
                    self.events.publish(RelayEvent::TrackAvailable {
                        participant: track.participant.clone(),
                        track_id: track.id.clone(),
                        kind: track.kind,
                    });
                    self.observers.track_available.notify(&track);
                }
            }
            TransportEvent::TrackUnpublished { participant, track_id } => {
                let ended = self.session.write().as_mut().and_then(|s| {
                    let mut track = s.remotes.get_mut(&participant)?.tracks.remove(&track_id)?;
                    let was_active = track.is_active();
                    track.transition(TrackState::Ended).ok()?;
                    was_active.then_some(track)
                });
                if let Some(track) = ended {
                    self.track_ended(&track);
                }
            }
            TransportEvent::DataReceived { sender, payload } => {
                tracing::trace!("{} bytes of data from {}", payload.len(), sender);
                self.observers
                    .messages
                    .notify(&ReceivedMessage { sender, payload });
            }
            TransportEvent::ConnectionInterrupted { .. } | TransportEvent::Disconnected { .. } => {}
        }
    }

    fn track_ended(&self, track: &Track) {
        tracing::info!("Remote track {} from {} ended", track.id, track.participant);
        self.events.publish(RelayEvent::TrackEnded {
            participant: track.participant.clone(),
            track_id: track.id.clone(),
        });
        self.observers.track_ended.notify(track);
    }

    /// Returns true once the session is connected again
    async fn reconnect(&self, link: &Arc<dyn TransportLink>, cancel: &CancellationToken) -> bool {
        if !self.transition(ConnectionState::Reconnecting) {
            return false;
        }
        self.bridges.pause_all();

        let policy = &self.config.reconnect;
        for attempt in 1..=policy.max_retries {
            let delay = policy.delay_for(attempt);
            tracing::info!(
                "Reconnect attempt {}/{} in {:?}",
                attempt,
                policy.max_retries,
                delay
            );
            self.events.publish(RelayEvent::ReconnectAttempt {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                result = async {
                    tokio::time::sleep(delay).await;
                    link.resume().await
                } => result,
            };

            match result {
                Ok(outcome) => {
                    if !outcome.tracks_preserved {
                        tracing::info!("Resumed with a fresh identity, rebuilding publications");
                        self.rebuild(link).await;
                    }
                    if cancel.is_cancelled() || !self.finish_reconnect(outcome.tracks_preserved) {
                        return false;
                    }
                    tracing::info!("Reconnected after {} attempt(s)", attempt);
                    return true;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("Reconnect rejected: {}", e);
                    self.events.publish(RelayEvent::ConnectionClosed {
                        reason: e.to_string(),
                    });
                    self.close_session(e.into()).await;
                    return false;
                }
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                }
            }
        }

        tracing::error!("Connection lost after {} reconnect attempts", policy.max_retries);
        self.events.publish(RelayEvent::ConnectionLost {
            attempts: policy.max_retries,
        });
        self.close_session(ConnectionError::ConnectionLost {
            attempts: policy.max_retries,
        })
        .await;
        false
    }

    /// Back to Connected; preserved bridges publish only after the state
    /// change
    fn finish_reconnect(&self, tracks_preserved: bool) -> bool {
        if !self.transition(ConnectionState::Connected) {
            return false;
        }
        if tracks_preserved {
            self.bridges.resume_all();
        }
        true
    }

    /// After a resume that lost our publications: drop every bridge, end the
    /// remote tracks (the transport announces them again) and republish local
    /// captures
    async fn rebuild(&self, link: &Arc<dyn TransportLink>) {
        self.bridges.teardown_all().await;

        let ended: Vec<Track> = match self.session.write().as_mut() {
            Some(session) => session
                .remotes
                .values_mut()
                .flat_map(|p| p.tracks.drain().map(|(_, track)| track))
                .filter_map(|mut track| {
                    let was_active = track.is_active();
                    track.transition(TrackState::Ended).ok()?;
                    was_active.then_some(track)
                })
                .collect(),
            None => Vec::new(),
        };
        for track in &ended {
            self.track_ended(track);
        }

        let ids: Vec<TrackId> = self.local_tracks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let Some(track) = self.local_tracks.get(&id).map(|p| p.track.clone()) else {
                continue;
            };
            match link.publish(&track).await {
                Ok(writer) => {
                    if let Some(publication) = self.local_tracks.get(&id) {
                        *publication.writer.write() = writer;
                    }
                    tracing::info!("Republished local track {}", id);
                }
                Err(e) => {
                    tracing::warn!("Local track {} lost on reconnect: {}", id, e);
                    if let Some((_, publication)) = self.local_tracks.remove(&id) {
                        publication.stop().await;
                    }
                    if let Some(session) = self.session.write().as_mut() {
                        session.local.tracks.remove(&id);
                    }
                    self.events.publish(RelayEvent::LocalTrackUnpublished { track_id: id });
                }
            }
        }
    }

    /// End the session on its own initiative
    async fn close_session(&self, error: ConnectionError) {
        *self.terminal_error.lock() = Some(error);
        self.teardown().await;
        self.transition(ConnectionState::Closed);
    }

    /// Release bridges, local publications and the link
    async fn teardown(&self) {
        let link = self.link.write().take();

        self.bridges.teardown_all().await;

        let ids: Vec<TrackId> = self.local_tracks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let Some((_, publication)) = self.local_tracks.remove(&id) else {
                continue;
            };
            publication.stop().await;
            if let Some(link) = &link {
                let _ = link.unpublish(&id).await;
            }
            self.events.publish(RelayEvent::LocalTrackUnpublished { track_id: id });
        }

        if let Some(link) = link {
            link.close().await;
        }
        self.session.write().take();
    }
}

/// Forward captured frames to the current writer while connected
async fn pump_local_frames(
    state: watch::Receiver<ConnectionState>,
    mut frames: FrameStream,
    writer: WriterSlot,
    cancel: CancellationToken,
    track_id: TrackId,
) {
    let mut write_errors = 0u64;
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => {
                    tracing::info!("Capture for {} ended", track_id);
                    break;
                }
            },
        };

        // Frames captured while reconnecting are dropped
        if *state.borrow() != ConnectionState::Connected {
            continue;
        }

        let current = writer.read().clone();
        if let Err(e) = current.write_frame(frame).await {
            write_errors += 1;
            if write_errors == 1 || write_errors % 100 == 0 {
                tracing::debug!("{}: write failed ({} total): {}", track_id, write_errors, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::transform::Passthrough;
    use crate::transport::LoopbackHub;
    use crate::video::TestPatternCapture;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const ADDRESS: &str = "loopback://session";

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.session.server_address = ADDRESS.to_string();
        config.reconnect = ReconnectConfig {
            max_retries: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 400,
        };
        config.publish = EncodingParams {
            width: 32,
            height: 18,
            frame_rate: 10,
            ..Default::default()
        };
        config
    }

    fn manager(hub: &LoopbackHub) -> SessionManager {
        SessionManager::new(Arc::new(hub.transport()), test_config())
    }

    async fn connected(hub: &LoopbackHub, identity: &str) -> SessionManager {
        let manager = manager(hub);
        manager
            .connect(ADDRESS, &hub.issue_token(identity))
            .await
            .unwrap();
        manager
    }

    async fn wait_for_state(manager: &SessionManager, target: ConnectionState) {
        let mut rx = manager.state_watch();
        tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| *s == target))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", target))
            .unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    /// Publishes a camera from a separate manager and waits until `worker`
    /// sees it active
    async fn camera(hub: &LoopbackHub, worker: &SessionManager) -> (SessionManager, TrackId) {
        let browser = connected(hub, "browser").await;
        let track = browser
            .publish_local_track(
                Box::new(TestPatternCapture::new("camera")),
                browser.config().publish.clone(),
            )
            .await
            .unwrap();
        let id = track.id.clone();
        let worker = worker.clone();
        let probe = id.clone();
        wait_until(move || worker.remote_tracks().iter().any(|t| t.id == probe && t.is_active())).await;
        (browser, id)
    }

    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn connect(&self, _: &str, _: &str) -> Result<Connection, TransportError> {
            std::future::pending().await
        }
    }

    /// Connects, then closes the manager from inside the handshake, the way a
    /// `disconnect` on another thread can land after the connect completes
    struct ClosingTransport {
        manager: Mutex<Option<std::sync::Weak<Inner>>>,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    struct ClosingLink {
        manager: Mutex<Option<std::sync::Weak<Inner>>>,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl Transport for ClosingTransport {
        async fn connect(&self, _: &str, _: &str) -> Result<Connection, TransportError> {
            let (_tx, events) = tokio::sync::mpsc::unbounded_channel();
            Ok(Connection {
                link: Arc::new(ClosingLink {
                    manager: Mutex::new(self.manager.lock().take()),
                    closed: self.closed.clone(),
                }),
                events,
            })
        }
    }

    #[async_trait]
    impl TransportLink for ClosingLink {
        fn local_identity(&self) -> &str {
            if let Some(inner) = self.manager.lock().take().and_then(|weak| weak.upgrade()) {
                inner.transition(ConnectionState::Closed);
            }
            "worker"
        }

        async fn subscribe(&self, track_id: &TrackId) -> Result<FrameStream, TransportError> {
            Err(TransportError::UnknownTrack(track_id.to_string()))
        }

        async fn publish(&self, _: &Track) -> Result<Arc<dyn TrackWriter>, TransportError> {
            Err(TransportError::NotConnected)
        }

        async fn unpublish(&self, _: &TrackId) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send_data(&self, _: &str, _: bytes::Bytes) -> Result<(), TransportError> {
            Err(TransportError::NotConnected)
        }

        async fn resume(&self) -> Result<crate::transport::ResumeOutcome, TransportError> {
            Err(TransportError::Closed)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_close_during_handshake_leaves_no_session() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let transport = Arc::new(ClosingTransport {
            manager: Mutex::new(None),
            closed: closed.clone(),
        });
        let worker = SessionManager::new(transport.clone(), test_config());
        *transport.manager.lock() = Some(Arc::downgrade(&worker.inner));

        assert_eq!(worker.connect(ADDRESS, "token").await, Err(ConnectionError::Aborted));
        assert_eq!(worker.state(), ConnectionState::Closed);
        assert!(worker.session_info().is_none());
        assert!(worker.link().is_none());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = manager(&hub);
        let token = hub.issue_token("worker");

        let first = worker.connect(ADDRESS, &token).await.unwrap();
        let second = worker.connect(ADDRESS, &token).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(worker.state(), ConnectionState::Connected);
        assert_eq!(worker.local_identity().as_deref(), Some("worker"));
        assert_eq!(hub.participants(), vec!["worker".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = manager(&hub);

        assert!(matches!(
            worker.connect(ADDRESS, "forged").await,
            Err(ConnectionError::Rejected(_))
        ));
        assert_eq!(worker.state(), ConnectionState::Disconnected);

        let token = hub.issue_token("worker");
        assert!(matches!(
            worker.connect("loopback://nowhere", &token).await,
            Err(ConnectionError::Unreachable(_))
        ));
        assert_eq!(worker.state(), ConnectionState::Disconnected);

        worker.connect(ADDRESS, &token).await.unwrap();
        assert_eq!(worker.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_in_every_state() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = manager(&hub);

        worker.disconnect().await;
        assert_eq!(worker.state(), ConnectionState::Disconnected);

        worker.connect(ADDRESS, &hub.issue_token("worker")).await.unwrap();
        worker.disconnect().await;
        assert_eq!(worker.state(), ConnectionState::Closed);
        assert!(worker.session_info().is_none());
        assert!(hub.participants().is_empty());

        worker.disconnect().await;
        assert_eq!(worker.state(), ConnectionState::Closed);

        // A closed manager can start a fresh session
        worker.connect(ADDRESS, &hub.issue_token("worker")).await.unwrap();
        assert_eq!(worker.state(), ConnectionState::Connected);
        worker.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_aborts_connect() {
        let worker = SessionManager::new(Arc::new(StalledTransport), test_config());

        let connecting = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.connect(ADDRESS, "token").await })
        };
        wait_for_state(&worker, ConnectionState::Connecting).await;

        worker.disconnect().await;
        assert_eq!(connecting.await.unwrap(), Err(ConnectionError::Aborted));
        assert_eq!(worker.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_observer_callbacks() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = connected(&hub, "worker").await;

        let joined = Arc::new(Mutex::new(Vec::new()));
        let available = Arc::new(Mutex::new(Vec::new()));
        let ended = Arc::new(AtomicUsize::new(0));
        let left = Arc::new(AtomicUsize::new(0));

        let _joined = {
            let joined = joined.clone();
            worker.on_participant_joined(move |identity| joined.lock().push(identity.clone()))
        };
        let _available = {
            let available = available.clone();
            worker.on_remote_track_available(move |track| available.lock().push(track.clone()))
        };
        let _ended = {
            let ended = ended.clone();
            worker.on_remote_track_ended(move |_| {
                ended.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _left = {
            let left = left.clone();
            worker.on_participant_left(move |_| {
                left.fetch_add(1, Ordering::SeqCst);
            })
        };

        let (browser, camera_id) = camera(&hub, &worker).await;
        assert_eq!(*joined.lock(), vec!["browser".to_string()]);
        {
            let available = available.lock();
            assert_eq!(available.len(), 1);
            assert_eq!(available[0].id, camera_id);
            assert!(available[0].is_video());
            assert_eq!(available[0].state(), TrackState::Active);
        }

        browser.unpublish_local_track(&camera_id).await.unwrap();
        {
            let ended = ended.clone();
            wait_until(move || ended.load(Ordering::SeqCst) == 1).await;
        }

        browser.disconnect().await;
        {
            let left = left.clone();
            wait_until(move || left.load(Ordering::SeqCst) == 1).await;
        }
        assert!(worker.remote_participants().is_empty());
        // The track had already ended; leaving does not end it twice
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bind_bridge_errors() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = manager(&hub);

        assert!(matches!(
            worker.bind_bridge(&TrackId::new("TR_x"), Arc::new(Passthrough)).await,
            Err(BridgeError::NotConnected(ConnectionState::Disconnected))
        ));

        worker.connect(ADDRESS, &hub.issue_token("worker")).await.unwrap();
        assert!(matches!(
            worker.bind_bridge(&TrackId::new("TR_x"), Arc::new(Passthrough)).await,
            Err(BridgeError::UnknownTrack(_))
        ));

        let (_browser, camera_id) = camera(&hub, &worker).await;
        let status = worker.bind_bridge(&camera_id, Arc::new(Passthrough)).await.unwrap();
        assert_eq!(status.inbound, camera_id);
        assert!(matches!(
            worker.bind_bridge(&camera_id, Arc::new(Passthrough)).await,
            Err(BridgeError::AlreadyBound(_))
        ));
        assert!(hub.published_tracks().iter().any(|t| t.id == status.outbound));

        worker.unbind_bridge(&camera_id).await.unwrap();
        assert!(!hub.published_tracks().iter().any(|t| t.id == status.outbound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_preserves_bridges() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = connected(&hub, "worker").await;
        let mut events = worker.events().subscribe();
        let (_browser, camera_id) = camera(&hub, &worker).await;
        let before = worker.bind_bridge(&camera_id, Arc::new(Passthrough)).await.unwrap();
        let publishes = hub.publish_count();

        hub.fail_next_resumes(1);
        hub.interrupt("worker");
        wait_for_state(&worker, ConnectionState::Reconnecting).await;
        assert!(worker.bridges().iter().all(|b| b.paused));
        wait_for_state(&worker, ConnectionState::Connected).await;

        let after = worker.bridges();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].outbound, before.outbound);
        assert!(!after[0].paused);
        assert_eq!(hub.publish_count(), publishes);

        let mut attempts = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RelayEvent::ReconnectAttempt { .. }) {
                attempts += 1;
            }
        }
        assert_eq!(attempts, 2);
        worker.disconnect().await;
    }

    #[tokio::test]
    async fn test_bridges_stay_paused_unless_connected() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = connected(&hub, "worker").await;
        let (_browser, camera_id) = camera(&hub, &worker).await;
        worker.bind_bridge(&camera_id, Arc::new(Passthrough)).await.unwrap();

        let inner = &worker.inner;
        assert!(inner.transition(ConnectionState::Reconnecting));
        inner.bridges.pause_all();

        // Closed while the resume was in flight
        assert!(inner.transition(ConnectionState::Closed));
        assert!(!inner.finish_reconnect(true));
        assert!(worker.bridges().iter().all(|b| b.paused));

        inner.teardown().await;
        assert_eq!(worker.bridge_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_with_fresh_identity_reannounces_tracks() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = connected(&hub, "worker").await;
        let (_browser, camera_id) = camera(&hub, &worker).await;
        worker.bind_bridge(&camera_id, Arc::new(Passthrough)).await.unwrap();
        let local = worker
            .publish_local_track(Box::new(TestPatternCapture::new("screen")), worker.config().publish.clone())
            .await
            .unwrap();

        let available = Arc::new(AtomicUsize::new(0));
        let ended = Arc::new(AtomicUsize::new(0));
        let _available = {
            let available = available.clone();
            worker.on_remote_track_available(move |_| {
                available.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _ended = {
            let ended = ended.clone();
            worker.on_remote_track_ended(move |_| {
                ended.fetch_add(1, Ordering::SeqCst);
            })
        };

        hub.set_resume_preserves_tracks(false);
        hub.interrupt("worker");
        wait_for_state(&worker, ConnectionState::Reconnecting).await;
        wait_for_state(&worker, ConnectionState::Connected).await;
        {
            let available = available.clone();
            wait_until(move || available.load(Ordering::SeqCst) == 1).await;
        }

        assert_eq!(ended.load(Ordering::SeqCst), 1);
        // Bridges are rebuilt by whoever observes the fresh track, not here
        assert_eq!(worker.bridge_count(), 0);
        assert!(worker
            .remote_tracks()
            .iter()
            .any(|t| t.id == camera_id && t.is_active()));
        // The local capture was republished under the same id
        assert!(hub.published_tracks().iter().any(|t| t.id == local.id));
        worker.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_after_retries() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = connected(&hub, "worker").await;
        let mut events = worker.events().subscribe();
        let (_browser, camera_id) = camera(&hub, &worker).await;
        worker.bind_bridge(&camera_id, Arc::new(Passthrough)).await.unwrap();

        hub.fail_next_resumes(10);
        hub.interrupt("worker");
        wait_for_state(&worker, ConnectionState::Closed).await;

        assert_eq!(
            worker.terminal_error(),
            Some(ConnectionError::ConnectionLost { attempts: 3 })
        );
        assert_eq!(worker.bridge_count(), 0);
        assert!(worker.session_info().is_none());

        let mut lost = false;
        while let Ok(event) = events.try_recv() {
            lost |= event == RelayEvent::ConnectionLost { attempts: 3 };
        }
        assert!(lost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_resume_is_not_retried() {
        let hub = LoopbackHub::new(ADDRESS);
        let token = hub.issue_token("worker");
        let worker = manager(&hub);
        worker.connect(ADDRESS, &token).await.unwrap();
        let mut events = worker.events().subscribe();

        hub.revoke_token(&token);
        hub.interrupt("worker");
        wait_for_state(&worker, ConnectionState::Closed).await;

        assert!(matches!(worker.terminal_error(), Some(ConnectionError::Rejected(_))));
        let mut attempts = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, RelayEvent::ReconnectAttempt { .. }) {
                attempts += 1;
            }
        }
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_server_kick_closes_session() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = connected(&hub, "worker").await;

        hub.kick("worker", "room deleted");
        wait_for_state(&worker, ConnectionState::Closed).await;
        assert!(matches!(
            worker.terminal_error(),
            Some(ConnectionError::ClosedByServer(reason)) if reason == "room deleted"
        ));
    }

    #[tokio::test]
    async fn test_publish_local_track_errors() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = manager(&hub);
        let params = worker.config().publish.clone();

        assert!(matches!(
            worker
                .publish_local_track(Box::new(TestPatternCapture::new("cam")), params.clone())
                .await,
            Err(PublishError::NotConnected(ConnectionState::Disconnected))
        ));

        worker.connect(ADDRESS, &hub.issue_token("worker")).await.unwrap();
        assert!(matches!(
            worker
                .publish_local_track(Box::new(TestPatternCapture::unavailable("cam")), params.clone())
                .await,
            Err(PublishError::DeviceUnavailable(_))
        ));

        hub.fail_next_publishes(1);
        assert!(matches!(
            worker
                .publish_local_track(Box::new(TestPatternCapture::new("cam")), params.clone())
                .await,
            Err(PublishError::NegotiationRejected(_))
        ));
        assert!(worker.local_tracks().is_empty());

        let track = worker
            .publish_local_track(Box::new(TestPatternCapture::new("cam")), params)
            .await
            .unwrap();
        assert_eq!(track.state(), TrackState::Active);
        assert_eq!(worker.local_tracks().len(), 1);
        assert!(hub.published_tracks().iter().any(|t| t.id == track.id));

        worker.unpublish_local_track(&track.id).await.unwrap();
        assert!(hub.published_tracks().is_empty());
        assert!(matches!(
            worker.unpublish_local_track(&track.id).await,
            Err(PublishError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_while_reconnecting_fails() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = connected(&hub, "worker").await;

        hub.fail_next_resumes(2);
        hub.interrupt("worker");
        wait_for_state(&worker, ConnectionState::Reconnecting).await;

        assert!(matches!(
            worker
                .publish_local_track(Box::new(TestPatternCapture::new("cam")), worker.config().publish.clone())
                .await,
            Err(PublishError::NotConnected(ConnectionState::Reconnecting))
        ));

        // Disconnect while reconnecting stops the retries
        worker.disconnect().await;
        assert_eq!(worker.state(), ConnectionState::Closed);
        assert!(worker.terminal_error().is_none());
    }
}
