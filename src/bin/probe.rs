//! probe - Open a stream URL and report frame delivery for a few seconds.
//!
//! Useful for checking a camera endpoint before wiring it into a
//! deployment: prints frame dimensions and freshness at a fixed interval,
//! then releases the handle.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::time::{Duration, Instant};

use framelink::{open_source, FramelinkConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe a camera stream URL for frame delivery")]
struct Args {
    /// Stream URL. `mjpeg+http(s)://` or bare `http(s)://` selects the
    /// multipart engine; `webrtc+http(s)://` selects the negotiated one.
    url: String,

    /// How long to probe before releasing the handle.
    #[arg(long, env = "FRAMELINK_PROBE_SECS", default_value = "10")]
    seconds: u64,

    /// Delay between reads.
    #[arg(long, env = "FRAMELINK_PROBE_INTERVAL_MS", default_value = "500")]
    interval_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = FramelinkConfig::load().context("load configuration")?;
    let mut source = open_source(&args.url, &config)?;
    source.start();

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut fresh_reads = 0u64;
    let mut empty_reads = 0u64;
    while Instant::now() < deadline {
        let (fresh, frame) = source.read();
        match (fresh, frame) {
            (true, Some(frame)) => {
                fresh_reads += 1;
                info!("frame {}x{}", frame.width(), frame.height());
            }
            _ => {
                empty_reads += 1;
                info!("no frame (opened={})", source.is_opened());
            }
        }
        std::thread::sleep(Duration::from_millis(args.interval_ms));
    }

    source.release();
    info!(
        "probe finished: {} fresh reads, {} empty reads",
        fresh_reads, empty_reads
    );
    Ok(())
}
