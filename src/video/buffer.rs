//! Bounded frame queue with drop-oldest overflow
//!
//! Single consumer, any number of producers. Producers never block: when the
//! queue is full the oldest waiting frame is evicted to make room, because
//! for live video a stale frame is worth less than a lost one.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::video::frame::VideoFrame;

/// Lock-free frame queue
pub struct FrameQueue {
    queue: ArrayQueue<VideoFrame>,
    notify: Notify,
    closed: AtomicBool,
    pushed: AtomicU64,
    overflow_count: AtomicU64,
    peak_len: AtomicUsize,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            overflow_count: AtomicU64::new(0),
            peak_len: AtomicUsize::new(0),
        }
    }

    /// Push a frame, evicting the oldest queued frame if full
    ///
    /// Returns the evicted frame, if any. Frames pushed after `close` are
    /// handed straight back.
    pub fn push(&self, frame: VideoFrame) -> Option<VideoFrame> {
        if self.closed.load(Ordering::Acquire) {
            return Some(frame);
        }

        let evicted = self.queue.force_push(frame);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }
        self.peak_len.fetch_max(self.queue.len(), Ordering::Relaxed);
        self.notify.notify_one();
        evicted
    }

    /// Pop the oldest frame without waiting
    pub fn try_pop(&self) -> Option<VideoFrame> {
        self.queue.pop()
    }

    /// Wait for the next frame
    ///
    /// Returns `None` once the queue is closed. Must only be awaited by the
    /// single consumer.
    pub async fn pop(&self) -> Option<VideoFrame> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(frame) = self.queue.pop() {
                return Some(frame);
            }
            self.notify.notified().await;
        }
    }

    /// Discard every queued frame, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Reject further frames and wake the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Total frames accepted
    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Frames evicted by drop-oldest
    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Highest occupancy observed
    pub fn peak_len(&self) -> usize {
        self.peak_len.load(Ordering::Relaxed)
    }
}
