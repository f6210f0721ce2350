//! Display sinks
//!
//! Routes a subscribed remote track into a caller-supplied sink, such as
//! a video element in a client shell. At most one sink per track.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DisplayError;
use crate::session::{ConnectionState, SessionManager};
use crate::tracks::TrackId;
use crate::video::VideoFrame;

/// Receives frames of one attached track
pub trait DisplaySink: Send + Sync {
    fn show(&self, frame: &VideoFrame);

    /// Called once when the track is detached or ends
    fn clear(&self) {}
}

struct Attachment {
    serial: u64,
    sink: Arc<dyn DisplaySink>,
    cancel: CancellationToken,
}

/// Track → sink routing for one session manager
pub struct DisplaySinks {
    manager: SessionManager,
    attached: Arc<DashMap<TrackId, Attachment>>,
    next_serial: AtomicU64,
}

impl DisplaySinks {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            attached: Arc::new(DashMap::new()),
            next_serial: AtomicU64::new(0),
        }
    }

    /// Start rendering `track_id` into `sink`
    pub async fn attach(&self, track_id: &TrackId, sink: Arc<dyn DisplaySink>) -> Result<(), DisplayError> {
        let state = self.manager.state();
        if state != ConnectionState::Connected {
            return Err(DisplayError::NotConnected(state));
        }

        let cancel = CancellationToken::new();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        match self.attached.entry(track_id.clone()) {
            Entry::Occupied(_) => return Err(DisplayError::AlreadyAttached(track_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(Attachment {
                    serial,
                    sink: sink.clone(),
                    cancel: cancel.clone(),
                });
            }
        }

        let mut frames = match self.manager.subscribe(track_id).await {
            Ok(frames) => frames,
            Err(e) => {
                self.attached.remove_if(track_id, |_, a| a.serial == serial);
                return Err(DisplayError::Subscribe(e));
            }
        };

        let attached = self.attached.clone();
        let id = track_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => sink.show(&frame),
                        None => {
                            tracing::info!("Display track {} ended", id);
                            // Leave a later re-attach of the same track alone
                            attached.remove_if(&id, |_, a| a.serial == serial);
                            sink.clear();
                            break;
                        }
                    },
                }
            }
        });

        tracing::info!("Attached display sink to {}", track_id);
        Ok(())
    }

    /// Stop rendering `track_id`; returns false if nothing was attached
    pub fn detach(&self, track_id: &TrackId) -> bool {
        match self.attached.remove(track_id) {
            Some((_, attachment)) => {
                attachment.cancel.cancel();
                attachment.sink.clear();
                tracing::info!("Detached display sink from {}", track_id);
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self, track_id: &TrackId) -> bool {
        self.attached.contains_key(track_id)
    }

    pub fn attached(&self) -> Vec<TrackId> {
        self.attached.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn detach_all(&self) {
        let ids = self.attached();
        for id in ids {
            self.detach(&id);
        }
    }
}

/// Sink that counts frames and logs the effective frame rate
pub struct FrameCounterSink {
    name: String,
    frames: AtomicU64,
    log_every: u64,
    started: Instant,
}

impl FrameCounterSink {
    pub fn new(name: &str, log_every: u64) -> Self {
        Self {
            name: name.to_string(),
            frames: AtomicU64::new(0),
            log_every: log_every.max(1),
            started: Instant::now(),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

impl DisplaySink for FrameCounterSink {
    fn show(&self, frame: &VideoFrame) {
        let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.log_every == 0 {
            let fps = count as f64 / self.started.elapsed().as_secs_f64().max(f64::EPSILON);
            tracing::info!(
                "{}: {} frames ({:.1} fps), {}x{}, caption {:?}",
                self.name,
                count,
                fps,
                frame.width,
                frame.height,
                frame.caption.as_deref().unwrap_or("")
            );
        }
    }

    fn clear(&self) {
        tracing::info!("{}: cleared after {} frames", self.name, self.frames());
    }
}
