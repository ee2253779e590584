//! Process configuration.
//!
//! Layered the same way across every deployment: built-in defaults, then
//! an optional JSON file named by `FRAMELINK_CONFIG`, then `FRAMELINK_*`
//! environment overrides, then validation. Engine-specific tuning lives
//! on the engine config structs; this module only assembles them.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::mjpeg::MjpegConfig;
use crate::rtc::RtcConfig;

#[derive(Debug, Deserialize, Default)]
struct FramelinkConfigFile {
    mjpeg: Option<MjpegConfigFile>,
    rtc: Option<RtcConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MjpegConfigFile {
    url: Option<String>,
    connect_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
    backoff_floor_secs: Option<u64>,
    backoff_cap_secs: Option<u64>,
    max_payload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RtcConfigFile {
    url: Option<String>,
    ice_servers: Option<Vec<String>>,
    signaling_timeout_secs: Option<u64>,
    stale_after_secs: Option<u64>,
    max_sample_bytes: Option<usize>,
}

/// Resolved process configuration.
#[derive(Debug, Clone, Default)]
pub struct FramelinkConfig {
    pub mjpeg: MjpegConfig,
    pub rtc: RtcConfig,
}

impl FramelinkConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FRAMELINK_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FramelinkConfigFile) -> Self {
        let mut cfg = Self::default();
        if let Some(mjpeg) = file.mjpeg {
            if let Some(url) = mjpeg.url {
                cfg.mjpeg.url = url;
            }
            if let Some(secs) = mjpeg.connect_timeout_secs {
                cfg.mjpeg.connect_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = mjpeg.read_timeout_secs {
                cfg.mjpeg.read_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = mjpeg.backoff_floor_secs {
                cfg.mjpeg.backoff_floor = Duration::from_secs(secs);
            }
            if let Some(secs) = mjpeg.backoff_cap_secs {
                cfg.mjpeg.backoff_cap = Duration::from_secs(secs);
            }
            if let Some(bytes) = mjpeg.max_payload_bytes {
                cfg.mjpeg.max_payload_bytes = bytes;
            }
        }
        if let Some(rtc) = file.rtc {
            if let Some(url) = rtc.url {
                cfg.rtc.url = url;
            }
            if let Some(servers) = rtc.ice_servers {
                cfg.rtc.ice_servers = servers;
            }
            if let Some(secs) = rtc.signaling_timeout_secs {
                cfg.rtc.signaling_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = rtc.stale_after_secs {
                cfg.rtc.stale_after = Duration::from_secs(secs);
            }
            if let Some(bytes) = rtc.max_sample_bytes {
                cfg.rtc.max_sample_bytes = bytes;
            }
        }
        cfg
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("FRAMELINK_MJPEG_URL") {
            if !url.trim().is_empty() {
                self.mjpeg.url = url;
            }
        }
        if let Ok(url) = std::env::var("FRAMELINK_RTC_URL") {
            if !url.trim().is_empty() {
                self.rtc.url = url;
            }
        }
        if let Ok(servers) = std::env::var("FRAMELINK_ICE_SERVERS") {
            let parsed = split_csv(&servers);
            if !parsed.is_empty() {
                self.rtc.ice_servers = parsed;
            }
        }
        if let Ok(secs) = std::env::var("FRAMELINK_STALE_SECS") {
            let seconds: u64 = secs
                .parse()
                .map_err(|_| anyhow!("FRAMELINK_STALE_SECS must be an integer number of seconds"))?;
            self.rtc.stale_after = Duration::from_secs(seconds);
        }
        if let Ok(secs) = std::env::var("FRAMELINK_BACKOFF_CAP_SECS") {
            let seconds: u64 = secs.parse().map_err(|_| {
                anyhow!("FRAMELINK_BACKOFF_CAP_SECS must be an integer number of seconds")
            })?;
            self.mjpeg.backoff_cap = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.mjpeg.backoff_floor.as_secs() == 0 {
            return Err(anyhow!("backoff floor must be greater than zero"));
        }
        if self.mjpeg.backoff_floor > self.mjpeg.backoff_cap {
            return Err(anyhow!("backoff floor must not exceed the backoff cap"));
        }
        if self.mjpeg.max_payload_bytes == 0 {
            return Err(anyhow!("max payload size must be greater than zero"));
        }
        if self.rtc.stale_after.as_secs() == 0 {
            return Err(anyhow!("stale threshold must be greater than zero"));
        }
        if self.rtc.max_sample_bytes == 0 {
            return Err(anyhow!("max sample size must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<FramelinkConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
