//! Media sample consumption primitives.
//!
//! Inbound RTP packets on the video track are reassembled into discrete
//! samples on the marker bit, decoded, and pushed into the frame queue.
//! Liveness is tracked from payload timestamps, not wall-clock arrival: a
//! transport that keeps delivering packets without advancing content
//! (keep-alive padding, frozen encoders) is still classified as dead.

use log::warn;
use std::time::{Duration, Instant};

/// Staleness policy driven by payload-timestamp progress.
///
/// Mutated only by the media consumption loop; read by `read`.
pub(crate) struct LivenessTracker {
    last_pts: Option<u32>,
    last_progress: Option<Instant>,
    threshold: Duration,
}

/// Freshness verdict computed at read time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Liveness {
    /// No sample has carried a timestamp yet.
    NoData,
    /// Payload timestamps advanced within the staleness threshold.
    Live,
    /// Progress stopped for longer than the threshold.
    Stale,
}

impl LivenessTracker {
    pub(crate) fn new(threshold: Duration) -> Self {
        Self {
            last_pts: None,
            last_progress: None,
            threshold,
        }
    }

    /// Record one sample's presentation timestamp. Only a changed
    /// timestamp counts as real progress; duplicates (keep-alive padding)
    /// do not refresh liveness.
    pub(crate) fn observe(&mut self, pts: u32, now: Instant) {
        if self.last_pts != Some(pts) {
            self.last_pts = Some(pts);
            self.last_progress = Some(now);
        }
    }

    pub(crate) fn verdict(&self, now: Instant) -> Liveness {
        match self.last_progress {
            None => Liveness::NoData,
            Some(progress) if now.duration_since(progress) <= self.threshold => Liveness::Live,
            Some(_) => Liveness::Stale,
        }
    }
}

/// Reassembles RTP payloads into complete samples.
///
/// Payload bytes accumulate until a packet with the marker bit closes the
/// sample; the sample carries the packet timestamp as its presentation
/// timestamp. An oversized sample is discarded wholesale.
pub(crate) struct SampleAssembler {
    buffer: Vec<u8>,
    max_sample_bytes: usize,
}

impl SampleAssembler {
    pub(crate) fn new(max_sample_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(128 * 1024),
            max_sample_bytes,
        }
    }

    pub(crate) fn push(&mut self, payload: &[u8], pts: u32, marker: bool) -> Option<(Vec<u8>, u32)> {
        if payload.is_empty() {
            return None;
        }
        if self.buffer.len() + payload.len() > self.max_sample_bytes {
            warn!(
                "media sample exceeded {} bytes; discarding",
                self.max_sample_bytes
            );
            self.buffer.clear();
            return None;
        }
        self.buffer.extend_from_slice(payload);
        if !marker {
            return None;
        }
        Some((std::mem::take(&mut self.buffer), pts))
    }
}
