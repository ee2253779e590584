//! Multipart (MJPEG-over-HTTP) ingestion engine.
//!
//! `MjpegSource` owns a persistent streaming GET connection and a single
//! background worker thread. The worker is responsible for:
//! - Opening the pull connection with connect/read timeouts
//! - Feeding arriving chunks into the marker scanner
//! - Overwriting the frame cache on every successful decode
//! - Reconnecting with exponential backoff on any connection-level failure
//!
//! The worker MUST NOT:
//! - Let a corrupt payload stop the pipeline (log and continue)
//! - Carry accumulator bytes across a reconnect
//! - Block the caller's `read` path on network activity

mod scan;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::frame::{decode_frame, FrameCache, VideoFrame};
use crate::source::{join_bounded, FrameSource};
use scan::MarkerScanner;

const CHUNK_BYTES: usize = 4096;
const STOP_POLL: Duration = Duration::from_millis(100);

/// Configuration for a multipart ingestion source.
#[derive(Clone, Debug)]
pub struct MjpegConfig {
    /// Stream URL (an `mjpeg+` prefix is stripped if present).
    pub url: String,
    /// Connect timeout for the streaming GET.
    pub connect_timeout: Duration,
    /// Read timeout for individual stream chunks.
    pub read_timeout: Duration,
    /// Reconnect backoff floor.
    pub backoff_floor: Duration,
    /// Reconnect backoff cap.
    pub backoff_cap: Duration,
    /// Upper bound on a single image payload; the accumulator is truncated
    /// past twice this size.
    pub max_payload_bytes: usize,
    /// Bounded wait when joining the worker on release.
    pub join_timeout: Duration,
}

impl Default for MjpegConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/stream".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            backoff_floor: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_payload_bytes: 5 * 1024 * 1024,
            join_timeout: Duration::from_secs(1),
        }
    }
}

/// Failure categories for the capture loop.
///
/// Transient failures are retried with backoff; fatal failures end the
/// worker and mark the handle not-open.
enum StreamFailure {
    Transient(anyhow::Error),
    Fatal(anyhow::Error),
}

struct Shared {
    running: AtomicBool,
    opened: AtomicBool,
    cache: FrameCache,
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Multipart ingestion stream handle.
pub struct MjpegSource {
    config: MjpegConfig,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl MjpegSource {
    pub fn new(mut config: MjpegConfig) -> Self {
        if let Some(rest) = config.url.strip_prefix("mjpeg+") {
            config.url = rest.to_string();
        }
        Self {
            config,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                opened: AtomicBool::new(false),
                cache: FrameCache::new(),
            }),
            worker: None,
        }
    }
}

impl FrameSource for MjpegSource {
    fn start(&mut self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.opened.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let config = self.config.clone();
        self.worker = Some(std::thread::spawn(move || capture_loop(config, shared)));
    }

    fn read(&self) -> (bool, Option<VideoFrame>) {
        match self.shared.cache.load() {
            Some(frame) => (true, Some(frame)),
            None => (false, None),
        }
    }

    fn is_opened(&self) -> bool {
        self.shared.opened.load(Ordering::Acquire)
    }

    fn release(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.opened.store(false, Ordering::Release);
        self.shared.cache.seal();
        if let Some(worker) = self.worker.take() {
            join_bounded(worker, self.config.join_timeout, &self.config.url);
        }
    }
}

impl Drop for MjpegSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn capture_loop(config: MjpegConfig, shared: Arc<Shared>) {
    info!("starting multipart capture loop for {}", config.url);

    if let Err(err) = validate_endpoint(&config.url) {
        error!("multipart endpoint rejected: {:#}", err);
        shared.opened.store(false, Ordering::Release);
        return;
    }

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(config.connect_timeout)
        .timeout_read(config.read_timeout)
        .build();
    let mut backoff = Backoff::new(config.backoff_floor, config.backoff_cap);

    while shared.running() {
        match stream_once(&agent, &config, &shared, &mut backoff) {
            Ok(()) => break, // stop requested mid-stream
            Err(StreamFailure::Transient(err)) => {
                if !shared.running() {
                    break;
                }
                warn!("multipart connection error for {}: {:#}", config.url, err);
                sleep_backoff(&shared, &mut backoff);
            }
            Err(StreamFailure::Fatal(err)) => {
                error!("multipart capture ended for {}: {:#}", config.url, err);
                shared.opened.store(false, Ordering::Release);
                return;
            }
        }
    }
    debug!("multipart capture loop for {} exited", config.url);
}

fn validate_endpoint(raw: &str) -> Result<()> {
    let url = url::Url::parse(raw).context("parse stream url")?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow!("unsupported multipart scheme '{}'", other)),
    }
}

/// One connection epoch: open the stream and pump chunks until the stream
/// fails or stop is requested. The scanner is local to the epoch, so a
/// reconnect discards any partial accumulator content.
fn stream_once(
    agent: &ureq::Agent,
    config: &MjpegConfig,
    shared: &Shared,
    backoff: &mut Backoff,
) -> Result<(), StreamFailure> {
    let response = agent
        .get(&config.url)
        .call()
        .map_err(|err| StreamFailure::Transient(anyhow!("open stream: {}", err)))?;

    let mut reader = response.into_reader();
    let mut scanner = MarkerScanner::new(config.max_payload_bytes);
    let mut chunk = vec![0u8; CHUNK_BYTES];

    loop {
        if !shared.running() {
            return Ok(());
        }
        let read = reader
            .read(&mut chunk)
            .map_err(|err| StreamFailure::Transient(anyhow!("read stream chunk: {}", err)))?;
        if read == 0 {
            return Err(StreamFailure::Transient(anyhow!("stream ended")));
        }

        scanner.extend(&chunk[..read]);
        while let Some(payload) = scanner.next_payload() {
            match decode_frame(&payload, None) {
                Ok(frame) => {
                    shared.cache.store(frame);
                    backoff.reset();
                }
                Err(err) => {
                    // Corrupt payloads never stop the pipeline.
                    debug!("frame decode error: {:#}", err);
                }
            }
        }
    }
}

/// Sleep the current backoff delay in short slices so a stop request is
/// observed promptly.
fn sleep_backoff(shared: &Shared, backoff: &mut Backoff) {
    let delay = backoff.next_delay();
    let deadline = Instant::now() + delay;
    while shared.running() && Instant::now() < deadline {
        std::thread::sleep(STOP_POLL.min(delay));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::VideoFrame;
    use image::RgbImage;

    fn encode_jpeg(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, image::Rgb([120, 40, 200]));
        let mut bytes = Vec::new();
        image
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Jpeg,
            )
            .expect("encode jpeg");
        bytes
    }

    #[test]
    fn corrupt_payload_does_not_block_next_frame() {
        let good = encode_jpeg(8, 8);
        let mut corrupt = vec![0xFF, 0xD8];
        corrupt.extend_from_slice(b"definitely not jpeg entropy data");
        corrupt.extend_from_slice(&[0xFF, 0xD9]);

        let mut scanner = MarkerScanner::new(1024 * 1024);
        scanner.extend(&corrupt);
        scanner.extend(&good);

        let mut frames: Vec<VideoFrame> = Vec::new();
        while let Some(payload) = scanner.next_payload() {
            if let Ok(frame) = decode_frame(&payload, None) {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].width(), 8);
    }

    #[test]
    fn decoded_frames_overwrite_cache_and_reset_backoff() {
        let shared = Shared {
            running: AtomicBool::new(true),
            opened: AtomicBool::new(true),
            cache: FrameCache::new(),
        };
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();

        let payload = encode_jpeg(4, 4);
        let frame = decode_frame(&payload, None).unwrap();
        shared.cache.store(frame);
        backoff.reset();

        assert!(shared.cache.load().is_some());
        assert_eq!(backoff.next_delay().as_secs(), 1);
    }

    #[test]
    fn release_before_start_is_harmless() {
        let mut source = MjpegSource::new(MjpegConfig::default());
        source.release();
        source.release();
        assert!(!source.is_opened());
        assert_eq!(source.read().0, false);
    }

    #[test]
    fn mjpeg_prefix_is_stripped() {
        let source = MjpegSource::new(MjpegConfig {
            url: "mjpeg+http://cam.local/stream".to_string(),
            ..MjpegConfig::default()
        });
        assert_eq!(source.config.url, "http://cam.local/stream");
    }
}
