//! The uniform stream-handle contract.
//!
//! Every ingestion engine exposes the same four operations so a consumer
//! is transport-agnostic: `start`, `read`, `is_opened`, `release`. No
//! error type crosses this boundary; the only failure signals are the
//! freshness boolean from `read` and the boolean from `is_opened`.

use crate::frame::VideoFrame;
use crate::mjpeg::{MjpegConfig, MjpegSource};
use crate::rtc::{RtcConfig, WebRtcSource};
use crate::FramelinkConfig;
use anyhow::{anyhow, Result};
use log::warn;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Uniform handle over one camera stream, regardless of transport.
///
/// Each handle owns exactly one background worker for its lifetime.
/// `start` and `release` are idempotent; `release` joins the worker with a
/// bounded wait and closes any held session or connection. `read` never
/// blocks on network activity.
pub trait FrameSource: Send {
    /// Launch the background worker. Calling `start` on a running handle
    /// is a no-op.
    fn start(&mut self);

    /// Latest-frame read: `(true, frame)` when a fresh frame is available,
    /// `(false, None)` otherwise.
    fn read(&self) -> (bool, Option<VideoFrame>);

    /// Whether the background worker is alive and not explicitly stopped.
    fn is_opened(&self) -> bool;

    /// Stop the worker, join with a bounded wait, and release buffers and
    /// any held session. After `release` returns, no further writes to
    /// this handle's stores occur.
    fn release(&mut self);
}

/// Build a stream handle for `url`, choosing the engine by scheme prefix.
///
/// `mjpeg+http(s)://` and bare `http(s)://` select the multipart engine;
/// `webrtc+http(s)://` selects the negotiated media engine.
pub fn open_source(url: &str, config: &FramelinkConfig) -> Result<Box<dyn FrameSource>> {
    if let Some(rest) = url.strip_prefix("webrtc+") {
        let rtc = RtcConfig {
            url: rest.to_string(),
            ..config.rtc.clone()
        };
        return Ok(Box::new(WebRtcSource::new(rtc)));
    }
    let stripped = url.strip_prefix("mjpeg+").unwrap_or(url);
    if !stripped.starts_with("http://") && !stripped.starts_with("https://") {
        return Err(anyhow!("unsupported stream url scheme: {}", url));
    }
    let mjpeg = MjpegConfig {
        url: stripped.to_string(),
        ..config.mjpeg.clone()
    };
    Ok(Box::new(MjpegSource::new(mjpeg)))
}

/// Join a worker thread, waiting at most `bound`. A worker stuck in a
/// blocking socket read is bounded by the read timeout; past the join
/// bound it is detached and left to die on its next stop-flag check.
pub(crate) fn join_bounded(worker: JoinHandle<()>, bound: Duration, label: &str) {
    let deadline = Instant::now() + bound;
    while !worker.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if worker.is_finished() {
        let _ = worker.join();
    } else {
        warn!("worker for {} did not stop within {:?}; detaching", label, bound);
    }
}
