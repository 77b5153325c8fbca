//! Decoded frames and the depth-1 "latest frame wins" slot.
//!
//! The capture thread publishes into a [`FrameSlot`] without ever blocking;
//! the processing cycle takes the newest frame out of it. A frame that is
//! replaced before it was taken is counted as dropped and never observed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use image::RgbImage;
use tokio::sync::Notify;

/// A decoded RGB frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Capture sequence number within one task (monotonic).
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(seq: u64, image: RgbImage) -> Self {
        Self {
            seq,
            captured_at: Utc::now(),
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Counters exposed by a frame slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub published: u64,
    pub taken: u64,
    pub dropped: u64,
}

/// Single-frame hand-off between a capture thread and a processing cycle.
#[derive(Debug, Default)]
pub struct FrameSlot {
    slot: Mutex<Option<Arc<Frame>>>,
    ready: Notify,
    published: AtomicU64,
    taken: AtomicU64,
    dropped: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held frame. Never blocks on the consumer.
    pub fn publish(&self, frame: Frame) {
        let previous = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.replace(Arc::new(frame))
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        if previous.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
    }

    /// Take the newest frame if one is waiting.
    pub fn take(&self) -> Option<Arc<Frame>> {
        let frame = self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        if frame.is_some() {
            self.taken.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Wait until a frame is available and take it.
    pub async fn next(&self) -> Arc<Frame> {
        loop {
            if let Some(frame) = self.take() {
                return frame;
            }
            self.ready.notified().await;
        }
    }

    /// Number of frames currently held (0 or 1).
    pub fn len(&self) -> usize {
        usize::from(self.slot.lock().unwrap_or_else(|e| e.into_inner()).is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard any held frame.
    pub fn clear(&self) {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            published: self.published.load(Ordering::Relaxed),
            taken: self.taken.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
