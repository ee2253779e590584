//! Decoded frames and the per-engine frame stores.
//!
//! This module provides:
//! - `VideoFrame`: a decoded RGB bitmap, immutable once produced.
//! - `FrameCache`: single-slot overwrite store fed by the multipart engine.
//! - `FrameQueue`: capacity-1 drop-oldest store fed by the media loop.
//!
//! Both stores hold at most one "current" frame at any instant. `read`
//! hands out a clone, so a caller never observes a frame mid-replacement.
//! Once a store is sealed (on handle release) all further writes are
//! silently dropped; a sealed store never reopens.

use anyhow::{Context, Result};
use image::RgbImage;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A decoded video frame: height x width x 3-channel color.
///
/// `pts` carries the payload-embedded presentation timestamp for transports
/// that have one (RTP); multipart streams leave it unset.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub image: RgbImage,
    pub pts: Option<u32>,
}

impl VideoFrame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Decode one encoded image payload (JPEG) into a `VideoFrame`.
pub(crate) fn decode_frame(bytes: &[u8], pts: Option<u32>) -> Result<VideoFrame> {
    let image = image::load_from_memory(bytes).context("decode image payload")?;
    Ok(VideoFrame {
        image: image.into_rgb8(),
        pts,
    })
}

struct StoreSlot {
    frame: Option<VideoFrame>,
    sealed: bool,
}

impl StoreSlot {
    fn new() -> Self {
        Self {
            frame: None,
            sealed: false,
        }
    }
}

/// Single-slot frame store with overwrite semantics.
///
/// The producer (ingestion worker) replaces the slot content atomically;
/// the consumer copies it out. Never blocks on network activity.
pub struct FrameCache {
    slot: Mutex<StoreSlot>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(StoreSlot::new()),
        }
    }

    /// Replace the cached frame. No-op after `seal`.
    pub fn store(&self, frame: VideoFrame) {
        let mut slot = self.slot.lock().unwrap();
        if slot.sealed {
            return;
        }
        slot.frame = Some(frame);
    }

    /// Copy out the latest frame, if any.
    pub fn load(&self) -> Option<VideoFrame> {
        self.slot.lock().unwrap().frame.clone()
    }

    /// Permanently close the store. Subsequent `store` calls are dropped.
    pub fn seal(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.sealed = true;
        slot.frame = None;
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded (capacity 1) frame queue with drop-oldest semantics.
///
/// `push_latest` evicts any queued frame before inserting, so the producer
/// never blocks. `pop_timeout` waits a bounded duration for a frame.
pub struct FrameQueue {
    slot: Mutex<StoreSlot>,
    available: Condvar,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(StoreSlot::new()),
            available: Condvar::new(),
        }
    }

    /// Insert a frame, evicting the previous one if still queued.
    pub fn push_latest(&self, frame: VideoFrame) {
        let mut slot = self.slot.lock().unwrap();
        if slot.sealed {
            return;
        }
        slot.frame = Some(frame);
        self.available.notify_one();
    }

    /// Take the queued frame, waiting at most `bound` for one to arrive.
    pub fn pop_timeout(&self, bound: Duration) -> Option<VideoFrame> {
        let slot = self.slot.lock().unwrap();
        let (mut slot, _timeout) = self
            .available
            .wait_timeout_while(slot, bound, |s| s.frame.is_none() && !s.sealed)
            .unwrap();
        slot.frame.take()
    }

    /// Permanently close the queue and wake any waiting consumer.
    pub fn seal(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.sealed = true;
        slot.frame = None;
        drop(slot);
        self.available.notify_all();
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}
