//! Effects relay worker
//!
//! The processing participant: every remote video track that becomes active
//! gets a bridge through the transform, every ended track loses its bridge,
//! and prompt messages retune the transform. Audio tracks are ignored.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{TransformConfig, TransformKind};
use crate::error::BridgeError;
use crate::session::{SessionManager, Subscription};
use crate::tracks::{TrackId, TrackKind};
use crate::transform::{EdgeOverlay, Passthrough, Transform};

enum Command {
    Bind(TrackId),
    Unbind(TrackId),
}

/// Build the transform selected by `config`
pub fn build_transform(config: &TransformConfig) -> Arc<dyn Transform> {
    match config.kind {
        TransformKind::Passthrough => Arc::new(Passthrough),
        TransformKind::Edges => Arc::new(EdgeOverlay::new(config.edge_threshold)),
    }
}

pub struct EffectsRelay {
    manager: SessionManager,
    transform: Arc<dyn Transform>,
    subscriptions: Vec<Subscription>,
    worker: JoinHandle<()>,
}

impl EffectsRelay {
    /// Start relaying on `manager`; tracks already active are bound too
    pub fn start(manager: SessionManager, transform: Arc<dyn Transform>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let available = {
            let tx = tx.clone();
            manager.on_remote_track_available(move |track| match track.kind {
                TrackKind::Video => {
                    let _ = tx.send(Command::Bind(track.id.clone()));
                }
                TrackKind::Audio => {
                    tracing::info!(
                        "Ignoring audio track {} from {}",
                        track.id,
                        track.participant
                    );
                }
            })
        };

        let ended = {
            let tx = tx.clone();
            manager.on_remote_track_ended(move |track| {
                if track.kind == TrackKind::Video {
                    let _ = tx.send(Command::Unbind(track.id.clone()));
                }
            })
        };

        let prompts = {
            let transform = transform.clone();
            manager.control().on_message(move |message| match message.prompt() {
                Ok(command) => {
                    tracing::info!("Prompt from {}: {:?}", message.sender, command.prompt);
                    transform.apply_prompt(&command.prompt);
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed control message from {}: {}", message.sender, e);
                }
            })
        };

        for track in manager.remote_tracks() {
            if track.is_video() && track.is_active() {
                let _ = tx.send(Command::Bind(track.id.clone()));
            }
        }

        let worker = tokio::spawn(Self::run(manager.clone(), transform.clone(), rx));

        tracing::info!("Effects relay started with transform {}", transform.name());

        Self {
            manager,
            transform,
            subscriptions: vec![available, ended, prompts],
            worker,
        }
    }

    async fn run(
        manager: SessionManager,
        transform: Arc<dyn Transform>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Bind(track_id) => {
                    match manager.bind_bridge(&track_id, transform.clone()).await {
                        Ok(status) => {
                            tracing::info!("Relaying {} as {}", status.inbound, status.outbound);
                        }
                        Err(BridgeError::AlreadyBound(_)) => {}
                        Err(e) => tracing::warn!("Cannot relay {}: {}", track_id, e),
                    }
                }
                Command::Unbind(track_id) => match manager.unbind_bridge(&track_id).await {
                    Ok(status) => tracing::info!(
                        "Stopped relaying {} ({} frames, {} overflow drops, {} timeouts)",
                        status.inbound,
                        status.frames_written,
                        status.scheduler.overflow_dropped,
                        status.scheduler.timeouts
                    ),
                    Err(BridgeError::NotBound(_)) => {}
                    Err(e) => tracing::warn!("Failed to stop relaying {}: {}", track_id, e),
                },
            }
        }
    }

    pub fn transform(&self) -> &Arc<dyn Transform> {
        &self.transform
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Stop reacting to new tracks and tear down every bridge
    pub async fn stop(self) {
        // Unregistering drops every command sender, so the worker drains and exits
        drop(self.subscriptions);
        if let Err(e) = self.worker.await {
            tracing::warn!("Relay worker panicked: {}", e);
        }

        for track_id in self.manager.bridges().into_iter().map(|b| b.inbound) {
            let _ = self.manager.unbind_bridge(&track_id).await;
        }
        tracing::info!("Effects relay stopped");
    }
}
