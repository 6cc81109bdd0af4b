//! Configuration for the capture core.
//!
//! This module holds the process-wide [`Settings`] (defaults plus `MICROBE_CAPTURE_*`
//! environment overrides) and the per-camera [`CameraConfig`] that a session is built from.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::env;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "MICROBE_CAPTURE_";

/// Identifies a camera: a device index for local hardware, or a stream address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CameraId {
    Index(u32),
    Address(String),
}

impl CameraId {
    pub fn as_index(&self) -> Option<u32> {
        match self {
            CameraId::Index(index) => Some(*index),
            CameraId::Address(_) => None,
        }
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraId::Index(index) => write!(f, "{index}"),
            CameraId::Address(address) => f.write_str(address),
        }
    }
}

impl FromStr for CameraId {
    type Err = Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = trimmed.parse::<u32>() {
                return Ok(CameraId::Index(index));
            }
        }
        Ok(CameraId::Address(trimmed.to_string()))
    }
}

impl From<u32> for CameraId {
    fn from(index: u32) -> Self {
        CameraId::Index(index)
    }
}

impl From<&str> for CameraId {
    fn from(value: &str) -> Self {
        match value.parse() {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }
}

impl From<String> for CameraId {
    fn from(value: String) -> Self {
        CameraId::from(value.as_str())
    }
}

impl Serialize for CameraId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CameraId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(CameraId::from(raw))
    }
}

/// Kind of source a camera is attached through.
///
/// Unknown names are kept as [`CameraType::Unsupported`] so that registering them succeeds
/// and the rejection surfaces from `start()`, before any device is touched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CameraType {
    Usb,
    Csi,
    Ip,
    Unsupported(String),
}

impl CameraType {
    pub fn as_str(&self) -> &str {
        match self {
            CameraType::Usb => "usb",
            CameraType::Csi => "csi",
            CameraType::Ip => "ip",
            CameraType::Unsupported(name) => name,
        }
    }
}

impl fmt::Display for CameraType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for CameraType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "usb" => CameraType::Usb,
            "csi" => CameraType::Csi,
            "ip" => CameraType::Ip,
            _ => CameraType::Unsupported(value.to_string()),
        }
    }
}

impl From<String> for CameraType {
    fn from(value: String) -> Self {
        CameraType::from(value.as_str())
    }
}

impl Serialize for CameraType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CameraType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(CameraType::from(raw))
    }
}

/// Immutable configuration of one camera, fixed when it is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: CameraId,
    pub camera_type: CameraType,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl CameraConfig {
    pub fn new(
        id: impl Into<CameraId>,
        camera_type: impl Into<CameraType>,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Self {
        Self {
            id: id.into(),
            camera_type: camera_type.into(),
            width,
            height,
            fps,
        }
    }

    /// Resolution formatted as `WIDTHxHEIGHT`
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Timing knobs of a camera session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Pause after a failed frame read before trying again
    pub read_retry: Duration,
    /// Upper bound on how long `stop()` waits for the acquisition thread
    pub stop_timeout: Duration,
    /// Upper bound on how long `start()` waits for the device to open
    pub open_timeout: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            read_retry: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
            open_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration settings for the capture application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Enable debug logging
    pub debug: bool,
    /// Camera used when a command doesn't name one
    pub default_camera_id: String,
    /// Camera type used when a command doesn't name one
    pub default_camera_type: String,
    pub default_width: u32,
    pub default_height: u32,
    pub default_fps: u32,
    /// Where saved snapshots go
    pub capture_directory: PathBuf,
    /// JPEG quality for saved snapshots (1-100)
    pub jpeg_quality: u8,
    pub read_retry_ms: u64,
    pub stop_timeout_ms: u64,
    pub open_timeout_ms: u64,
    /// Serve generated test-pattern frames instead of opening hardware
    pub synthetic_cameras: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let timings = SessionTimings::default();
        Self {
            debug: false,
            default_camera_id: "0".to_string(),
            default_camera_type: "usb".to_string(),
            default_width: 1280,
            default_height: 720,
            default_fps: 30,
            capture_directory: PathBuf::from("./data/captures"),
            jpeg_quality: 80,
            read_retry_ms: timings.read_retry.as_millis() as u64,
            stop_timeout_ms: timings.stop_timeout.as_millis() as u64,
            open_timeout_ms: timings.open_timeout.as_millis() as u64,
            synthetic_cameras: false,
        }
    }
}

impl Settings {
    /// Create a new instance of Settings with environment variable overrides
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let mut settings = Settings::default();
        settings.apply_overrides(|key| env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        settings.create_directories()?;
        Ok(settings)
    }

    /// Apply overrides from `lookup`, which is keyed by the variable name without prefix
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(debug) = lookup("DEBUG") {
            self.debug = debug.parse()?;
        }
        if let Some(camera_id) = lookup("CAMERA_ID") {
            self.default_camera_id = camera_id;
        }
        if let Some(camera_type) = lookup("CAMERA_TYPE") {
            self.default_camera_type = camera_type;
        }
        if let Some(width) = lookup("WIDTH") {
            self.default_width = width.parse()?;
        }
        if let Some(height) = lookup("HEIGHT") {
            self.default_height = height.parse()?;
        }
        if let Some(fps) = lookup("FPS") {
            self.default_fps = fps.parse()?;
        }
        if let Some(capture_directory) = lookup("CAPTURE_DIRECTORY") {
            self.capture_directory = PathBuf::from(capture_directory);
        }
        if let Some(jpeg_quality) = lookup("JPEG_QUALITY") {
            self.jpeg_quality = jpeg_quality.parse()?;
        }
        if let Some(read_retry_ms) = lookup("READ_RETRY_MS") {
            self.read_retry_ms = read_retry_ms.parse()?;
        }
        if let Some(stop_timeout_ms) = lookup("STOP_TIMEOUT_MS") {
            self.stop_timeout_ms = stop_timeout_ms.parse()?;
        }
        if let Some(open_timeout_ms) = lookup("OPEN_TIMEOUT_MS") {
            self.open_timeout_ms = open_timeout_ms.parse()?;
        }
        if let Some(synthetic_cameras) = lookup("SYNTHETIC_CAMERAS") {
            self.synthetic_cameras = synthetic_cameras.parse()?;
        }
        Ok(())
    }

    fn create_directories(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.capture_directory.exists() {
            fs::create_dir_all(&self.capture_directory)?;
        }
        Ok(())
    }

    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            read_retry: Duration::from_millis(self.read_retry_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            open_timeout: Duration::from_millis(self.open_timeout_ms),
        }
    }

    /// Camera configuration built from the defaults
    pub fn default_camera(&self) -> CameraConfig {
        CameraConfig::new(
            self.default_camera_id.as_str(),
            self.default_camera_type.as_str(),
            self.default_width,
            self.default_height,
            self.default_fps,
        )
    }
}
