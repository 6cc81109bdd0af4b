//! Platform camera stack via nokhwa.
//!
//! Opens local devices by index (V4L2 on Linux, MediaFoundation on Windows, AVFoundation on
//! macOS) and decodes every frame to packed RGB. CSI and RTSP descriptors aren't claimed
//! here; the GStreamer backend opens those.

use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    utils::{
        ApiBackend, CameraFormat, CameraIndex, CameraInfo as NokhwaCameraInfo, FrameFormat,
        RequestedFormat, RequestedFormatType, Resolution,
    },
};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{CaptureDevice, DeviceBackend, DeviceReport};
use crate::config::CameraId;
use crate::frame::Frame;
use crate::pipeline::{DescriptorKind, DeviceDescriptor};
use crate::{OurError, OurResult};

const CAPABILITIES: [DescriptorKind; 2] = [DescriptorKind::Usb, DescriptorKind::Generic];

/// Select the best API backend for the current platform
fn platform_backend() -> ApiBackend {
    #[cfg(target_os = "linux")]
    return ApiBackend::Video4Linux;

    #[cfg(target_os = "windows")]
    return ApiBackend::MediaFoundation;

    #[cfg(target_os = "macos")]
    return ApiBackend::AVFoundation;

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    ApiBackend::Auto
}

#[derive(Debug, Default)]
pub struct NativeBackend;

impl NativeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn capabilities(&self) -> &[DescriptorKind] {
        &CAPABILITIES
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> OurResult<Box<dyn CaptureDevice>> {
        let (index, api, requested) = match descriptor {
            DeviceDescriptor::Usb {
                index,
                width,
                height,
                fps,
                ..
            } => {
                let format =
                    CameraFormat::new(Resolution::new(*width, *height), FrameFormat::YUYV, *fps);
                (
                    CameraIndex::Index(*index),
                    platform_backend(),
                    RequestedFormatType::Closest(format),
                )
            }
            DeviceDescriptor::Generic { target } => {
                let index = match target {
                    CameraId::Index(index) => CameraIndex::Index(*index),
                    CameraId::Address(address) => CameraIndex::String(address.clone()),
                };
                (
                    index,
                    ApiBackend::Auto,
                    RequestedFormatType::AbsoluteHighestFrameRate,
                )
            }
            other => {
                return Err(OurError::App(format!(
                    "native backend can't open {} descriptors",
                    other.kind()
                )));
            }
        };

        let mut camera = Camera::with_backend(
            index.clone(),
            RequestedFormat::new::<RgbFormat>(requested),
            api,
        )
        .map_err(|e| OurError::App(format!("Failed to create camera {index}: {e}")))?;

        camera
            .open_stream()
            .map_err(|e| OurError::App(format!("Failed to open camera stream: {e}")))?;

        info!(
            "Opened {} via {:?} at {:?}",
            camera.info().human_name(),
            api,
            camera.camera_format()
        );
        Ok(Box::new(NativeDevice { camera }))
    }
}

struct NativeDevice {
    camera: Camera,
}

impl CaptureDevice for NativeDevice {
    fn read_frame(&mut self) -> OurResult<Frame> {
        let buffer = self
            .camera
            .frame()
            .map_err(|e| OurError::TransientRead(e.to_string()))?;
        let image = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| OurError::TransientRead(format!("Failed to decode frame: {e}")))?;
        let (width, height) = image.dimensions();
        Frame::new(height, width, 3, image.into_raw())
    }

    fn apply_format(&mut self, width: u32, height: u32, fps: u32) -> OurResult<()> {
        self.camera
            .set_resolution(Resolution::new(width, height))
            .map_err(|e| OurError::App(format!("Failed to set resolution: {e}")))?;
        self.camera
            .set_frame_rate(fps)
            .map_err(|e| OurError::App(format!("Failed to set frame rate: {e}")))?;
        Ok(())
    }

    fn minimize_buffering(&mut self) -> OurResult<()> {
        // nokhwa exposes no queue depth; its driver buffers are drained on every frame() call
        debug!("Native device keeps its driver default buffer depth");
        Ok(())
    }

    fn report(&self) -> DeviceReport {
        let resolution = self.camera.resolution();
        DeviceReport {
            fps: Some(f64::from(self.camera.frame_rate())),
            width: Some(resolution.width()),
            height: Some(resolution.height()),
        }
    }
}

impl Drop for NativeDevice {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            warn!("Failed to stop camera stream: {e}");
        }
    }
}

/// A local camera the platform stack can see
#[derive(Debug, Clone, Serialize)]
pub struct NativeCameraInfo {
    pub index: String,
    pub name: String,
    pub description: String,
    /// USB vendor ID, when the description carries one
    pub vendor_id: Option<String>,
    /// USB product ID, when the description carries one
    pub product_id: Option<String>,
}

/// Enumerate local cameras
pub fn enumerate() -> OurResult<Vec<NativeCameraInfo>> {
    let backend = platform_backend();
    info!("Detecting cameras with backend: {backend:?}");

    let cameras = nokhwa::query(backend)
        .map_err(|e| OurError::App(format!("Failed to query cameras: {e}")))?;

    let vendor = Regex::new(r"(?i)vid[_:]([0-9a-f]{4})")
        .map_err(|e| OurError::App(format!("Bad vendor pattern: {e}")))?;
    let product = Regex::new(r"(?i)pid[_:]([0-9a-f]{4})")
        .map_err(|e| OurError::App(format!("Bad product pattern: {e}")))?;

    let detected: Vec<NativeCameraInfo> = cameras
        .iter()
        .map(|camera| describe(camera, &vendor, &product))
        .collect();
    info!("Detected {} cameras", detected.len());
    Ok(detected)
}

fn describe(camera: &NokhwaCameraInfo, vendor: &Regex, product: &Regex) -> NativeCameraInfo {
    let description = camera.description().to_string();
    NativeCameraInfo {
        index: camera.index().to_string(),
        name: camera.human_name().to_string(),
        vendor_id: capture_hex(vendor, &description),
        product_id: capture_hex(product, &description),
        description,
    }
}

fn capture_hex(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_uppercase())
}
