//! framelink
//!
//! Live camera ingestion over two transports behind one handle contract.
//!
//! # Architecture
//!
//! Every stream is a `FrameSource`: `start` spawns exactly one background
//! worker, `read` is a non-blocking latest-frame fetch, `is_opened`
//! reports worker health, and `release` tears everything down with a
//! bounded join. Consumers never see transport errors, only the freshness
//! boolean from `read`.
//!
//! # Module Structure
//!
//! - `mjpeg`: multipart-over-HTTP ingestion with marker scanning and
//!   exponential reconnect backoff
//! - `rtc`: negotiated media sessions (server-offer protocol with
//!   client-offer fallback), payload-timestamp liveness
//! - `frame`: decoded frames plus the single-slot cache and the
//!   capacity-one queue
//! - `config`: layered file/env configuration

pub mod backoff;
pub mod config;
pub mod frame;
pub mod mjpeg;
pub mod rtc;
pub mod source;

pub use backoff::Backoff;
pub use config::FramelinkConfig;
pub use frame::{FrameCache, FrameQueue, VideoFrame};
pub use mjpeg::{MjpegConfig, MjpegSource};
pub use rtc::verify::{
    select_verifier, Fingerprint, IdentityVerifier, LegacyFingerprintVerifier, ModernVerifier,
    PeerParameters,
};
pub use rtc::{HttpSignaling, RtcConfig, SignalingClient, SignalingReply, WebRtcSource};
pub use source::{open_source, FrameSource};
