//! Frame scheduler
//!
//! Decouples frame arrival from transform throughput. Frames wait in a
//! drop-oldest [`FrameQueue`]; a single worker task hands them to the
//! transform one at a time under a per-frame deadline and forwards results
//! in strictly increasing timestamp order.
//!
//! ```text
//!  submit() ──► FrameQueue (N, drop-oldest) ──► worker ──► Transform::process
//!                                                 │            (≤ T_max)
//!                                                 ▼
//!                                        output channel (ts ascending)
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::events::{EventBus, RelayEvent};
use crate::tracks::TrackId;
use crate::transform::Transform;
use crate::video::buffer::FrameQueue;
use crate::video::frame::VideoFrame;

/// Scheduler statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Frames accepted by `submit`
    pub submitted: u64,
    /// Frames evicted by drop-oldest before dispatch
    pub overflow_dropped: u64,
    /// Frames handed to the transform
    pub dispatched: u64,
    /// Results forwarded to the output channel
    pub emitted: u64,
    /// Calls abandoned at the deadline
    pub timeouts: u64,
    /// Calls that returned an error
    pub failures: u64,
    /// Frames or results thrown away for staleness, pause or shutdown,
    /// including emitted results the output gate refused
    pub discarded: u64,
    pub queue_len: usize,
    pub peak_queue_len: usize,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    emitted: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to a running scheduler
///
/// Dropping the handle cancels the worker; `shutdown` additionally waits for
/// it to finish.
pub struct Scheduler {
    label: TrackId,
    queue: Arc<FrameQueue>,
    counters: Arc<Counters>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Start a scheduler feeding `transform` and writing results to `output`
    pub fn spawn(
        label: TrackId,
        config: &SchedulerConfig,
        transform: Arc<dyn Transform>,
        output: mpsc::Sender<VideoFrame>,
        events: EventBus,
    ) -> Self {
        let queue = Arc::new(FrameQueue::new(config.queue_capacity.max(1)));
        let counters = Arc::new(Counters::default());
        let (paused, paused_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let worker = Worker {
            label: label.clone(),
            queue: queue.clone(),
            counters: counters.clone(),
            transform,
            output,
            events,
            deadline: config.processing_deadline(),
            streak_threshold: config.timeout_streak_threshold.max(1),
            paused: paused_rx,
            cancel: cancel.clone(),
            last_emitted: None,
            timeout_streak: 0,
        };

        tracing::debug!(
            "Scheduler for {} started (capacity {}, deadline {:?})",
            label,
            queue.capacity(),
            worker.deadline
        );

        Self {
            label,
            queue,
            counters,
            paused,
            cancel,
            worker: Some(tokio::spawn(worker.run())),
        }
    }

    /// Queue a frame for processing; never blocks
    ///
    /// Returns false if an older queued frame had to be evicted, or the
    /// scheduler is shutting down and the frame was refused.
    pub fn submit(&self, frame: VideoFrame) -> bool {
        self.queue.push(frame).is_none()
    }

    /// Submit handle that producer tasks can own
    pub fn input(&self) -> FrameInput {
        FrameInput {
            queue: self.queue.clone(),
        }
    }

    /// Stop dispatching; queued frames stay subject to drop-oldest
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn label(&self) -> &TrackId {
        &self.label
    }

    pub fn stats(&self) -> SchedulerStats {
        snapshot(&self.queue, &self.counters)
    }

    /// Gate for the consumer of the output channel
    pub fn output_gate(&self) -> OutputGate {
        OutputGate {
            queue: self.queue.clone(),
            counters: self.counters.clone(),
            paused: self.paused.subscribe(),
        }
    }

    /// Cancel the in-flight call, discard queued frames and wait for the
    /// worker to exit
    pub async fn shutdown(mut self) -> SchedulerStats {
        self.cancel.cancel();
        self.queue.close();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                tracing::warn!("Scheduler worker for {} panicked: {}", self.label, e);
            }
        }
        self.stats()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.queue.close();
    }
}

fn snapshot(queue: &FrameQueue, counters: &Counters) -> SchedulerStats {
    SchedulerStats {
        submitted: queue.pushed_count(),
        overflow_dropped: queue.overflow_count(),
        dispatched: counters.dispatched.load(Ordering::Relaxed),
        emitted: counters.emitted.load(Ordering::Relaxed),
        timeouts: counters.timeouts.load(Ordering::Relaxed),
        failures: counters.failures.load(Ordering::Relaxed),
        discarded: counters.discarded.load(Ordering::Relaxed),
        queue_len: queue.len(),
        peak_queue_len: queue.peak_len(),
    }
}

/// Consumer side of a scheduler's output
///
/// Results already emitted when the scheduler is paused must not be
/// published either; `admit` drops them and counts them as discarded.
pub struct OutputGate {
    queue: Arc<FrameQueue>,
    counters: Arc<Counters>,
    paused: watch::Receiver<bool>,
}

impl OutputGate {
    /// Whether a result taken from the output may be written now
    pub fn admit(&self) -> bool {
        if *self.paused.borrow() {
            Counters::bump(&self.counters.discarded);
            return false;
        }
        true
    }

    pub fn stats(&self) -> SchedulerStats {
        snapshot(&self.queue, &self.counters)
    }
}

/// Producer side of a scheduler
#[derive(Clone)]
pub struct FrameInput {
    queue: Arc<FrameQueue>,
}

impl FrameInput {
    /// Same contract as [`Scheduler::submit`]
    pub fn submit(&self, frame: VideoFrame) -> bool {
        self.queue.push(frame).is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

struct Worker {
    label: TrackId,
    queue: Arc<FrameQueue>,
    counters: Arc<Counters>,
    transform: Arc<dyn Transform>,
    output: mpsc::Sender<VideoFrame>,
    events: EventBus,
    deadline: Duration,
    streak_threshold: u32,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
    last_emitted: Option<u64>,
    timeout_streak: u32,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if !self.wait_until_running().await {
                break;
            }

            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                frame = self.queue.pop() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            if *self.paused.borrow() {
                Counters::bump(&self.counters.discarded);
                continue;
            }

            // Never dispatch a frame that could not be emitted in order
            if self.last_emitted.is_some_and(|last| frame.timestamp_us <= last) {
                tracing::trace!(
                    "{}: dropping stale frame ts={} (last emitted {:?})",
                    self.label,
                    frame.timestamp_us,
                    self.last_emitted
                );
                Counters::bump(&self.counters.discarded);
                continue;
            }

            if !self.dispatch(frame).await {
                break;
            }
        }

        self.queue.close();
        let flushed = self.queue.clear() as u64;
        self.counters.discarded.fetch_add(flushed, Ordering::Relaxed);
        tracing::debug!("Scheduler for {} stopped ({} queued frames flushed)", self.label, flushed);
    }

    /// Returns false when the worker should exit
    async fn wait_until_running(&mut self) -> bool {
        loop {
            if !*self.paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Run one frame through the transform; returns false when the worker
    /// should exit
    async fn dispatch(&mut self, frame: VideoFrame) -> bool {
        let (timestamp_us, sequence) = (frame.timestamp_us, frame.sequence);
        Counters::bump(&self.counters.dispatched);

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                // The transform future is dropped here; its result never surfaces
                Counters::bump(&self.counters.discarded);
                return false;
            }
            outcome = tokio::time::timeout(self.deadline, self.transform.process(frame)) => outcome,
        };

        let processed = match outcome {
            Err(_) => {
                self.on_timeout(timestamp_us);
                return true;
            }
            Ok(Err(e)) => {
                Counters::bump(&self.counters.failures);
                tracing::warn!("{}: transform failed on ts={}: {}", self.label, timestamp_us, e);
                return true;
            }
            Ok(Ok(processed)) => processed,
        };

        if self.timeout_streak >= self.streak_threshold {
            tracing::info!("{}: processing recovered", self.label);
            self.events.publish(RelayEvent::ProcessingRecovered {
                track_id: self.label.clone(),
            });
        }
        self.timeout_streak = 0;

        if *self.paused.borrow() {
            Counters::bump(&self.counters.discarded);
            return true;
        }

        let processed = processed.with_timing(timestamp_us, sequence);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Counters::bump(&self.counters.discarded);
                false
            }
            sent = self.output.send(processed) => {
                if sent.is_err() {
                    tracing::debug!("{}: output closed", self.label);
                    return false;
                }
                self.last_emitted = Some(timestamp_us);
                Counters::bump(&self.counters.emitted);
                true
            }
        }
    }

    fn on_timeout(&mut self, timestamp_us: u64) {
        Counters::bump(&self.counters.timeouts);
        self.timeout_streak += 1;
        tracing::debug!(
            "{}: frame ts={} abandoned after {:?}",
            self.label,
            timestamp_us,
            self.deadline
        );

        if self.timeout_streak == self.streak_threshold {
            tracing::warn!(
                "{}: {} consecutive processing timeouts, output frame rate degraded",
                self.label,
                self.timeout_streak
            );
            self.events.publish(RelayEvent::DegradedProcessing {
                track_id: self.label.clone(),
                consecutive_timeouts: self.timeout_streak,
            });
        }
    }
}
