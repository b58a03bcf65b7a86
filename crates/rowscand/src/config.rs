//! Daemon configuration from `ROWSCAN_*` environment variables.
//!
//! Every value has a default. A value that does not parse, or falls outside
//! its valid range, is logged and replaced by the default.

use rowscan_core::codec::{
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_QUANTIZATION_BITS, MAX_COMPRESSION_LEVEL, MAX_QUANTIZATION_BITS,
};
use rowscan_core::EncodeOptions;
use rowscan_hw::{CameraSettings, DeviceBackend, PipelineSettings, SimulatedBackend};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable carrying the serialized config to the worker.
pub const WORKER_CONFIG_ENV: &str = "ROWSCAN_WORKER_CONFIG";

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root of the capture tree (`<line>/row_<r>/capture_<c>/`).
    pub pointcloud_dir: PathBuf,
    /// Directory holding `extrinsics_*.toml` and `alignment_*.toml`.
    pub calibration_dir: PathBuf,
    /// First preview port; 0 for ephemeral ports.
    pub stream_port_base: u16,
    pub pipeline_fps: u32,
    pub video_fps: u32,
    /// Device identities never brought up.
    pub excluded_devices: Vec<String>,
    pub cors_origin: String,
    pub queue_poll_ms: u64,
    pub frame_timeout_ms: u64,
    /// Bound on each per-device shutdown step.
    pub device_shutdown_ms: u64,
    /// Bound on the worker's exit after SIGTERM.
    pub worker_shutdown_ms: u64,
    /// Pause between consecutive device bring-ups.
    pub bringup_delay_ms: u64,
    /// Also write `rgb-camera-<i>.png` next to each capture.
    pub save_rgb: bool,
    pub quantization_bits: u8,
    pub compression_level: u8,
    pub sim_devices: Vec<String>,
    /// `<identity>` (open failure) or `<identity>:stall`.
    pub sim_fail: Vec<String>,
    pub sim_noise_mm: f64,
}

impl Config {
    /// Load configuration from `ROWSCAN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rowscan");

        Self {
            pointcloud_dir: lookup("ROWSCAN_POINTCLOUD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("pointclouds")),
            calibration_dir: lookup("ROWSCAN_CALIBRATION_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("calibration")),
            stream_port_base: env_parse(&lookup, "ROWSCAN_STREAM_PORT_BASE", 5000),
            pipeline_fps: env_parse(&lookup, "ROWSCAN_PIPELINE_FPS", 30),
            video_fps: env_parse(&lookup, "ROWSCAN_VIDEO_FPS", 20),
            excluded_devices: env_list(&lookup, "ROWSCAN_EXCLUDED_DEVICES", &[]),
            cors_origin: lookup("ROWSCAN_CORS_ORIGIN")
                .unwrap_or_else(|| "http://localhost:8042".to_string()),
            queue_poll_ms: env_parse(&lookup, "ROWSCAN_QUEUE_POLL_MS", 100),
            frame_timeout_ms: env_parse(&lookup, "ROWSCAN_FRAME_TIMEOUT_MS", 5000),
            device_shutdown_ms: env_parse(&lookup, "ROWSCAN_DEVICE_SHUTDOWN_MS", 5000),
            worker_shutdown_ms: env_parse(&lookup, "ROWSCAN_WORKER_SHUTDOWN_MS", 10_000),
            bringup_delay_ms: env_parse(&lookup, "ROWSCAN_BRINGUP_DELAY_MS", 2000),
            save_rgb: lookup("ROWSCAN_SAVE_RGB")
                .map(|v| v != "0")
                .unwrap_or(false),
            quantization_bits: env_ranged(
                &lookup,
                "ROWSCAN_QUANTIZATION_BITS",
                1..=MAX_QUANTIZATION_BITS,
                DEFAULT_QUANTIZATION_BITS,
            ),
            compression_level: env_ranged(
                &lookup,
                "ROWSCAN_COMPRESSION_LEVEL",
                0..=MAX_COMPRESSION_LEVEL,
                DEFAULT_COMPRESSION_LEVEL,
            ),
            sim_devices: env_list(
                &lookup,
                "ROWSCAN_SIM_DEVICES",
                &["10.95.76.11", "10.95.76.12", "10.95.76.13"],
            ),
            sim_fail: env_list(&lookup, "ROWSCAN_SIM_FAIL", &[]),
            sim_noise_mm: env_parse(&lookup, "ROWSCAN_SIM_NOISE_MM", 0.0),
        }
    }

    /// Config handed over by the parent in [`WORKER_CONFIG_ENV`].
    pub fn from_worker_env() -> Result<Option<Self>, serde_json::Error> {
        match std::env::var(WORKER_CONFIG_ENV) {
            Ok(json) => serde_json::from_str(&json).map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            pipeline: PipelineSettings {
                pipeline_fps: self.pipeline_fps,
                video_fps: self.video_fps,
            },
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.device_shutdown_ms),
            cors_origin: self.cors_origin.clone(),
            preview: true,
        }
    }

    pub fn encode_options(&self) -> EncodeOptions {
        EncodeOptions {
            quantization_bits: self.quantization_bits,
            compression_level: self.compression_level,
        }
    }

    /// The device backend this build ships with.
    pub fn backend(&self) -> Arc<dyn DeviceBackend> {
        Arc::new(SimulatedBackend::from_config(
            self.sim_devices.as_slice(),
            self.sim_fail.as_slice(),
            self.sim_noise_mm,
        ))
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms.max(1))
    }

    pub fn worker_shutdown(&self) -> Duration {
        Duration::from_millis(self.worker_shutdown_ms)
    }

    pub fn bringup_delay(&self) -> Duration {
        Duration::from_millis(self.bringup_delay_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable value; using default");
            default
        }),
        None => default,
    }
}

fn env_ranged<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    range: RangeInclusive<T>,
    default: T,
) -> T
where
    T: FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let value = env_parse(lookup, key, default);
    if range.contains(&value) {
        return value;
    }
    tracing::warn!(key, %value, min = %range.start(), max = %range.end(), "value out of range; using default");
    default
}

/// Comma-separated list; an empty value yields an empty list.
fn env_list(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &[&str]) -> Vec<String> {
    match lookup(key) {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}
