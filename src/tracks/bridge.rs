//! Track bridge
//!
//! Pairs one inbound video track with one outbound publication:
//!
//! ```text
//!  inbound stream ──► pump ──► Scheduler ──► writer ──► outbound TrackWriter
//!                                  │
//!                              Transform
//! ```
//!
//! The outbound publication exists exactly as long as the bridge does.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::SchedulerConfig;
use crate::error::{BridgeError, TransportError};
use crate::events::{EventBus, RelayEvent};
use crate::tracks::{EncodingParams, Track, TrackDirection, TrackId, TrackKind, TrackState};
use crate::transform::Transform;
use crate::transport::TransportLink;
use crate::video::{Scheduler, SchedulerStats};

/// Frames between periodic statistics lines
const STATS_LOG_FRAMES: u64 = 30;

/// Settings shared by every bridge of a session
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub scheduler: SchedulerConfig,
    /// Encoding requested for the outbound publication
    pub outbound: EncodingParams,
    pub outbound_name: String,
}

/// Serializable bridge snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub inbound: TrackId,
    pub outbound: TrackId,
    pub participant: String,
    pub transform: String,
    pub paused: bool,
    /// Resolution of the last frame written out
    pub output_resolution: Option<(u32, u32)>,
    pub frames_written: u64,
    pub write_errors: u64,
    pub scheduler: SchedulerStats,
}

#[derive(Default)]
struct WriterStats {
    frames_written: AtomicU64,
    write_errors: AtomicU64,
    resolution: Mutex<Option<(u32, u32)>>,
}

pub struct TrackBridge {
    inbound: Track,
    outbound: Track,
    transform_name: String,
    link: Arc<dyn TransportLink>,
    scheduler: Scheduler,
    stats: Arc<WriterStats>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    writer: JoinHandle<()>,
    events: EventBus,
    /// Stops both tasks if the bridge is dropped without `unbind`
    _guard: DropGuard,
}

impl TrackBridge {
    /// Outbound track id derived from the inbound one
    pub fn outbound_id(inbound: &TrackId, name: &str) -> TrackId {
        TrackId::new(format!("{}-{}", inbound, name))
    }

    /// Subscribe to `inbound`, publish its processed counterpart and start
    /// the pipeline
    pub async fn bind(
        link: Arc<dyn TransportLink>,
        inbound: &Track,
        transform: Arc<dyn Transform>,
        config: &BridgeConfig,
        events: EventBus,
    ) -> Result<Self, BridgeError> {
        if inbound.kind != TrackKind::Video {
            return Err(BridgeError::NotVideo(inbound.id.clone()));
        }
        if inbound.state() != TrackState::Active {
            return Err(BridgeError::NotActive {
                id: inbound.id.clone(),
                state: inbound.state(),
            });
        }

        let mut frames = link.subscribe(&inbound.id).await.map_err(BridgeError::Subscribe)?;

        let mut outbound = Track::new(
            Self::outbound_id(&inbound.id, &config.outbound_name),
            link.local_identity(),
            config.outbound_name.clone(),
            TrackKind::Video,
            TrackDirection::Outbound,
        )
        .with_encoding(config.outbound.clone());

        let sink = link.publish(&outbound).await.map_err(BridgeError::Publish)?;
        if let Err(e) = outbound.transition(TrackState::Active) {
            tracing::warn!("{}", e);
        }

        let (out_tx, mut out_rx) = mpsc::channel(config.scheduler.output_capacity.max(1));
        let scheduler = Scheduler::spawn(
            inbound.id.clone(),
            &config.scheduler,
            transform.clone(),
            out_tx,
            events.clone(),
        );

        let cancel = CancellationToken::new();

        let input = scheduler.input();
        let pump_cancel = cancel.clone();
        let inbound_id = inbound.id.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = pump_cancel.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => {
                            input.submit(frame);
                        }
                        None => {
                            tracing::info!("Inbound stream {} ended", inbound_id);
                            break;
                        }
                    },
                }
            }
        });

        let stats = Arc::new(WriterStats::default());
        let writer_stats = stats.clone();
        let gate = scheduler.output_gate();
        let writer_cancel = cancel.clone();
        let outbound_id = outbound.id.clone();
        let writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = writer_cancel.cancelled() => break,
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                // Paused while the result waited in the channel
                if !gate.admit() {
                    continue;
                }

                let resolution = frame.resolution();
                {
                    let mut current = writer_stats.resolution.lock();
                    if *current != Some(resolution) {
                        tracing::info!(
                            "{}: output resolution {}x{}",
                            outbound_id,
                            resolution.0,
                            resolution.1
                        );
                        *current = Some(resolution);
                    }
                }

                match sink.write_frame(frame).await {
                    Ok(()) => {
                        let written = writer_stats.frames_written.fetch_add(1, Ordering::Relaxed) + 1;
                        if written % STATS_LOG_FRAMES == 0 {
                            let scheduler = gate.stats();
                            tracing::debug!(
                                "{}: {} frames written ({} overflow drops, {} timeouts, {} failures, {} discarded)",
                                outbound_id,
                                written,
                                scheduler.overflow_dropped,
                                scheduler.timeouts,
                                scheduler.failures,
                                scheduler.discarded
                            );
                        }
                    }
                    Err(e) => {
                        let errors = writer_stats.write_errors.fetch_add(1, Ordering::Relaxed) + 1;
                        if errors == 1 || errors % 100 == 0 {
                            tracing::warn!("{}: write failed ({} total): {}", outbound_id, errors, e);
                        }
                    }
                }
            }
        });

        tracing::info!(
            "Bridge {} -> {} bound ({})",
            inbound.id,
            outbound.id,
            transform.name()
        );
        events.publish(RelayEvent::BridgeBound {
            inbound: inbound.id.clone(),
            outbound: outbound.id.clone(),
        });

        Ok(Self {
            inbound: inbound.clone(),
            outbound,
            transform_name: transform.name().to_string(),
            link,
            scheduler,
            stats,
            _guard: cancel.clone().drop_guard(),
            cancel,
            pump,
            writer,
            events,
        })
    }

    pub fn inbound(&self) -> &Track {
        &self.inbound
    }

    pub fn outbound(&self) -> &Track {
        &self.outbound
    }

    /// Stop processing; nothing is published until `resume`
    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            inbound: self.inbound.id.clone(),
            outbound: self.outbound.id.clone(),
            participant: self.inbound.participant.clone(),
            transform: self.transform_name.clone(),
            paused: self.scheduler.is_paused(),
            output_resolution: *self.stats.resolution.lock(),
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            write_errors: self.stats.write_errors.load(Ordering::Relaxed),
            scheduler: self.scheduler.stats(),
        }
    }

    /// Stop the pipeline and withdraw the outbound publication
    ///
    /// A frame still inside the transform is abandoned and never written.
    pub async fn unbind(self) -> BridgeStatus {
        let TrackBridge {
            inbound,
            mut outbound,
            transform_name,
            link,
            scheduler,
            stats,
            cancel,
            pump,
            writer,
            events,
            _guard,
        } = self;

        cancel.cancel();
        let paused = scheduler.is_paused();
        let scheduler_stats = scheduler.shutdown().await;
        let _ = pump.await;
        let _ = writer.await;

        match link.unpublish(&outbound.id).await {
            Ok(()) => {}
            // Already withdrawn by the server (participant left, identity lost)
            Err(TransportError::UnknownTrack(_)) | Err(TransportError::Closed) => {}
            Err(e) => tracing::warn!("Failed to unpublish {}: {}", outbound.id, e),
        }
        let _ = outbound.transition(TrackState::Ended);

        tracing::info!(
            "Bridge {} -> {} unbound ({} frames written)",
            inbound.id,
            outbound.id,
            stats.frames_written.load(Ordering::Relaxed)
        );
        events.publish(RelayEvent::BridgeUnbound {
            inbound: inbound.id.clone(),
            outbound: outbound.id.clone(),
        });

        let output_resolution = *stats.resolution.lock();
        BridgeStatus {
            inbound: inbound.id,
            outbound: outbound.id,
            participant: inbound.participant,
            transform: transform_name,
            paused,
            output_resolution,
            frames_written: stats.frames_written.load(Ordering::Relaxed),
            write_errors: stats.write_errors.load(Ordering::Relaxed),
            scheduler: scheduler_stats,
        }
    }
}
