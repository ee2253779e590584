//! Negotiated media ingestion engine.
//!
//! A `WebRtcSource` owns one worker thread per handle. The worker drives
//! a single-threaded async runtime: it negotiates a peer session against
//! the signaling endpoint (server-offer protocol first, client-offer
//! fallback second), then parks while the session's track callback feeds
//! decoded frames into the capacity-one queue.
//!
//! This module MUST NOT:
//! - block `read` on network activity
//! - write to the frame queue after `release` has returned
//! - reuse a peer session across negotiation attempts

mod consume;
mod endpoint;
mod negotiate;
mod signaling;
pub mod verify;

pub use signaling::{HttpSignaling, SignalingClient, SignalingReply};

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::{FrameQueue, VideoFrame};
use crate::source::{join_bounded, FrameSource};
use consume::{Liveness, LivenessTracker};
use negotiate::{Negotiator, PeerEndpoint};

/// Tuning for the negotiated media engine.
#[derive(Debug, Clone)]
pub struct RtcConfig {
    /// Signaling endpoint, scheme prefix already stripped.
    pub url: String,
    /// STUN/TURN urls offered to the remote side during negotiation.
    pub ice_servers: Vec<String>,
    /// Connect and read timeout for signaling HTTP exchanges.
    pub signaling_timeout: Duration,
    /// Upper bound on the wait for local candidate gathering.
    pub gather_bound: Duration,
    /// Poll interval while waiting for candidate gathering.
    pub gather_poll: Duration,
    /// How long `read` waits for a queued frame before falling back to
    /// the previously returned one.
    pub read_bound: Duration,
    /// Payload-timestamp liveness threshold; a session whose timestamps
    /// stop advancing for this long is torn down.
    pub stale_after: Duration,
    /// Cap on one reassembled media sample.
    pub max_sample_bytes: usize,
    /// Bounded wait when joining the worker thread during release.
    pub join_timeout: Duration,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            signaling_timeout: Duration::from_secs(10),
            gather_bound: Duration::from_secs(3),
            gather_poll: Duration::from_millis(100),
            read_bound: Duration::from_millis(100),
            stale_after: Duration::from_secs(5),
            max_sample_bytes: 8 * 1024 * 1024,
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// State shared between the handle, the worker, and the session callbacks.
pub(crate) struct RtcShared {
    stopped: AtomicBool,
    opened: AtomicBool,
    session_failed: AtomicBool,
    pub(crate) queue: FrameQueue,
    liveness: Mutex<LivenessTracker>,
}

impl RtcShared {
    fn new(stale_after: Duration) -> Self {
        Self {
            stopped: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            session_failed: AtomicBool::new(false),
            queue: FrameQueue::new(),
            liveness: Mutex::new(LivenessTracker::new(stale_after)),
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_session_failed(&self) {
        self.session_failed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn observe_pts(&self, pts: u32) {
        if let Ok(mut tracker) = self.liveness.lock() {
            tracker.observe(pts, Instant::now());
        }
    }

    fn verdict(&self) -> Liveness {
        match self.liveness.lock() {
            Ok(tracker) => tracker.verdict(Instant::now()),
            Err(_) => Liveness::NoData,
        }
    }
}

/// Stream handle backed by a negotiated peer session.
pub struct WebRtcSource {
    config: RtcConfig,
    signaling: Arc<dyn SignalingClient>,
    shared: Arc<RtcShared>,
    worker: Option<JoinHandle<()>>,
    last_frame: Mutex<Option<VideoFrame>>,
}

impl WebRtcSource {
    pub fn new(config: RtcConfig) -> Self {
        let signaling: Arc<dyn SignalingClient> =
            Arc::new(HttpSignaling::new(&config.url, config.signaling_timeout));
        Self::with_signaling(config, signaling)
    }

    /// Build a handle over an explicit signaling client. Lets tests run
    /// the full handle lifecycle without a network endpoint.
    pub fn with_signaling(config: RtcConfig, signaling: Arc<dyn SignalingClient>) -> Self {
        let shared = Arc::new(RtcShared::new(config.stale_after));
        Self {
            config,
            signaling,
            shared,
            worker: None,
            last_frame: Mutex::new(None),
        }
    }

    fn stop_and_seal(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.opened.store(false, Ordering::SeqCst);
        self.shared.queue.seal();
    }
}

impl FrameSource for WebRtcSource {
    fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        self.shared.stopped.store(false, Ordering::SeqCst);
        self.shared.session_failed.store(false, Ordering::SeqCst);
        self.shared.opened.store(true, Ordering::SeqCst);

        let config = self.config.clone();
        let signaling = self.signaling.clone();
        let shared = self.shared.clone();
        self.worker = Some(std::thread::spawn(move || {
            run_session(config, signaling, shared);
        }));
    }

    fn read(&self) -> (bool, Option<VideoFrame>) {
        if let Liveness::Stale = self.shared.verdict() {
            warn!("stream timestamps stalled; tearing down session");
            self.stop_and_seal();
            return (false, None);
        }
        if let Some(frame) = self.shared.queue.pop_timeout(self.config.read_bound) {
            if let Ok(mut last) = self.last_frame.lock() {
                *last = Some(frame.clone());
            }
            return (true, Some(frame));
        }
        match self.last_frame.lock() {
            Ok(last) => match last.clone() {
                Some(frame) => (true, Some(frame)),
                None => (false, None),
            },
            Err(_) => (false, None),
        }
    }

    fn is_opened(&self) -> bool {
        self.shared.opened.load(Ordering::SeqCst)
    }

    fn release(&mut self) {
        self.stop_and_seal();
        if let Some(worker) = self.worker.take() {
            join_bounded(worker, self.config.join_timeout, "webrtc worker");
        }
        if let Ok(mut last) = self.last_frame.lock() {
            *last = None;
        }
    }
}

impl Drop for WebRtcSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Worker body: negotiate, then park until stop or session failure.
fn run_session(config: RtcConfig, signaling: Arc<dyn SignalingClient>, shared: Arc<RtcShared>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            warn!("stream runtime setup failed: {}", err);
            shared.opened.store(false, Ordering::SeqCst);
            return;
        }
    };

    runtime.block_on(async {
        let mut negotiator = Negotiator::new(signaling, config.ice_servers.clone());
        let endpoint = match negotiator
            .establish(|| endpoint::WebRtcEndpoint::connect(&config, shared.clone()))
            .await
        {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!("stream negotiation failed: {:#}", err);
                shared.opened.store(false, Ordering::SeqCst);
                return;
            }
        };
        match negotiator.session_id() {
            Some(id) => info!("stream connected, session {}", id),
            None => info!("stream connected via client-offer fallback"),
        }

        while !shared.stop_requested() && !shared.session_failed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        endpoint.close().await;
        shared.opened.store(false, Ordering::SeqCst);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    /// Stalls every signaling exchange long enough that negotiation is
    /// still pending when the test inspects the handle.
    struct StalledSignaling {
        delay: Duration,
    }

    impl SignalingClient for StalledSignaling {
        fn post_json(&self, _payload: &serde_json::Value) -> anyhow::Result<SignalingReply> {
            std::thread::sleep(self.delay);
            bail!("signaling endpoint unreachable")
        }

        fn post_sdp(&self, _sdp: &str) -> anyhow::Result<SignalingReply> {
            std::thread::sleep(self.delay);
            bail!("signaling endpoint unreachable")
        }
    }

    fn stalled_source() -> WebRtcSource {
        let config = RtcConfig {
            url: "http://cam.local/webrtc".to_string(),
            read_bound: Duration::from_millis(5),
            join_timeout: Duration::from_millis(200),
            ..RtcConfig::default()
        };
        WebRtcSource::with_signaling(
            config,
            Arc::new(StalledSignaling {
                delay: Duration::from_secs(5),
            }),
        )
    }

    #[test]
    fn opened_flag_tracks_start_and_release() {
        let mut source = stalled_source();
        assert!(!source.is_opened());

        source.start();
        assert!(source.is_opened());

        source.release();
        assert!(!source.is_opened());
    }

    #[test]
    fn read_without_frames_reports_no_data() {
        let mut source = stalled_source();
        source.start();
        let (fresh, frame) = source.read();
        assert!(!fresh);
        assert!(frame.is_none());
        source.release();
    }

    #[test]
    fn stalled_timestamps_force_teardown_on_read() {
        let source = stalled_source();
        source.shared.opened.store(true, Ordering::SeqCst);
        {
            let mut tracker = source.shared.liveness.lock().unwrap();
            tracker.observe(100, Instant::now() - Duration::from_secs(60));
        }

        let (fresh, frame) = source.read();
        assert!(!fresh);
        assert!(frame.is_none());
        assert!(!source.is_opened());

        // Teardown sealed the queue; later producer writes are dropped.
        source.shared.queue.push_latest(VideoFrame {
            image: image::RgbImage::new(2, 2),
            pts: Some(300),
        });
        assert!(source
            .shared
            .queue
            .pop_timeout(Duration::from_millis(5))
            .is_none());
    }

    #[test]
    fn start_is_idempotent() {
        let mut source = stalled_source();
        source.start();
        source.start();
        assert!(source.is_opened());
        source.release();
    }
}
